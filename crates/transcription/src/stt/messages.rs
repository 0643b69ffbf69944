use serde::{Deserialize, Serialize};

use crate::aggregator::Fragment;
use crate::config::TranscriptionConfig;

/// Control frames the client sends. Audio itself travels as binary frames.
#[derive(Debug, Serialize)]
#[serde(tag = "message")]
pub enum ClientMessage {
    StartRecognition {
        audio_format: AudioFormat,
        transcription_config: RecognitionConfig,
    },
}

#[derive(Debug, Serialize)]
pub struct AudioFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub encoding: &'static str,
    pub sample_rate: u32,
}

impl AudioFormat {
    /// The only format the pipeline produces: raw little-endian 16-bit
    /// PCM, 16 kHz, mono.
    pub fn pcm_16k_mono() -> Self {
        Self {
            kind: "raw",
            encoding: "pcm_s16le",
            sample_rate: 16_000,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecognitionConfig {
    pub language: String,
    pub operating_point: String,
    pub enable_partials: bool,
    pub max_delay: f64,
}

impl RecognitionConfig {
    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self {
            language: config.language.clone(),
            operating_point: config.operating_point.clone(),
            enable_partials: config.enable_partials,
            max_delay: config.max_delay_seconds,
        }
    }
}

/// Control frames the provider sends, tagged by `message`. Anything that
/// fails to parse is logged at debug and ignored; the process never dies
/// on a provider protocol violation.
#[derive(Debug, Deserialize)]
#[serde(tag = "message")]
pub enum ServerMessage {
    RecognitionStarted {
        #[serde(default)]
        id: Option<String>,
    },
    AddTranscript(TranscriptPayload),
    AddPartialTranscript(TranscriptPayload),
    EndOfTranscript,
    Error {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        reason: String,
    },
    Warning {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptPayload {
    pub metadata: TranscriptMetadata,
    #[serde(default)]
    pub results: Vec<TranscriptResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptMetadata {
    pub transcript: String,
    pub start_time: f64,
    pub end_time: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptResult {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub language: Option<String>,
}

impl TranscriptPayload {
    /// Collapses the payload into one fragment: provider text and bounds,
    /// confidence averaged over the best alternatives.
    pub fn to_fragment(&self) -> Fragment {
        let mut sum = 0.0;
        let mut count = 0u32;
        let mut language = None;
        for result in &self.results {
            if let Some(best) = result.alternatives.first() {
                if let Some(confidence) = best.confidence {
                    sum += confidence;
                    count += 1;
                }
                if language.is_none() {
                    language = best.language.clone();
                }
            }
        }
        let confidence = if count > 0 { sum / count as f64 } else { 1.0 };

        Fragment {
            text: self.metadata.transcript.clone(),
            confidence,
            start_time: self.metadata.start_time,
            end_time: self.metadata.end_time,
            language,
        }
    }
}
