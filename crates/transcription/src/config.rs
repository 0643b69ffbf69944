use std::time::Duration;

/// Configuration for the per-room transcription pipeline.
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Websocket endpoint of the external transcription provider.
    pub provider_endpoint: String,
    /// Bearer token for the provider.
    pub provider_api_key: String,
    /// Language declared in `StartRecognition` (ISO 639-1).
    pub language: String,
    /// Provider operating point (accuracy/latency trade-off).
    pub operating_point: String,
    /// Ask the provider for partial results. Partials are never persisted
    /// either way; final-only is what lands in the store.
    pub enable_partials: bool,
    /// Provider-side cap on how long a final can lag the audio.
    pub max_delay_seconds: f64,
    /// Utterance buffer flushes beyond this many characters.
    pub utterance_max_chars: usize,
    /// Utterance buffer flushes after this long without a new fragment.
    pub utterance_idle_flush: Duration,
    /// Transcript sink: rows per insert.
    pub batch_size: usize,
    /// Transcript sink: max age of the oldest pending row.
    pub batch_interval: Duration,
    /// Transcript sink: pending-row cap; oldest rows are shed beyond it.
    pub queue_cap: usize,
    /// How long `stop()` waits for the provider's clean close.
    pub close_grace: Duration,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider_endpoint: String::new(),
            provider_api_key: String::new(),
            language: "en".to_string(),
            operating_point: "enhanced".to_string(),
            enable_partials: false,
            max_delay_seconds: 2.0,
            utterance_max_chars: 500,
            utterance_idle_flush: Duration::from_secs(2),
            batch_size: 10,
            batch_interval: Duration::from_millis(100),
            queue_cap: 500,
            close_grace: Duration::from_millis(500),
        }
    }
}
