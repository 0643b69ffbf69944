use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// One finalized fragment from the provider.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub text: String,
    pub confidence: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub language: Option<String>,
}

/// A buffered group of fragments flushed as one transcript row.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    /// Mean fragment confidence.
    pub confidence: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub language: Option<String>,
    /// Wall clock captured at flush; becomes the row timestamp.
    pub finalized_at: DateTime<Utc>,
}

/// Groups finalized fragments into utterances.
///
/// Flushes when the newest fragment ends a sentence, when the buffer
/// exceeds the size cap, or when no fragment has arrived for the idle
/// window (the owner polls [`idle_deadline`](Self::idle_deadline)).
/// Overlapping triggers drain once: the buffer is taken and reset in a
/// single step.
pub struct UtteranceAggregator {
    max_chars: usize,
    idle_flush: std::time::Duration,
    buffer: String,
    confidence_sum: f64,
    fragment_count: u32,
    start_time: f64,
    end_time: f64,
    language: Option<String>,
    last_fragment_at: Option<Instant>,
}

impl UtteranceAggregator {
    pub fn new(max_chars: usize, idle_flush: std::time::Duration) -> Self {
        Self {
            max_chars,
            idle_flush,
            buffer: String::new(),
            confidence_sum: 0.0,
            fragment_count: 0,
            start_time: 0.0,
            end_time: 0.0,
            language: None,
            last_fragment_at: None,
        }
    }

    /// Appends a fragment; returns a flushed utterance when a trigger hit.
    pub fn push(&mut self, fragment: Fragment) -> Option<Utterance> {
        let trimmed = fragment.text.trim();
        if trimmed.is_empty() {
            return None;
        }

        if self.fragment_count == 0 {
            self.start_time = fragment.start_time;
        }
        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(trimmed);
        self.confidence_sum += fragment.confidence;
        self.fragment_count += 1;
        self.end_time = fragment.end_time;
        if self.language.is_none() {
            self.language = fragment.language;
        }
        self.last_fragment_at = Some(Instant::now());

        let sentence_done = trimmed.ends_with(['.', '!', '?']);
        if sentence_done || self.buffer.len() > self.max_chars {
            self.flush()
        } else {
            None
        }
    }

    /// When the idle timer should fire; `None` while the buffer is empty.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.last_fragment_at.map(|at| at + self.idle_flush)
    }

    pub fn is_empty(&self) -> bool {
        self.fragment_count == 0
    }

    /// Drains the buffer into an utterance, if any.
    pub fn flush(&mut self) -> Option<Utterance> {
        if self.fragment_count == 0 {
            return None;
        }

        let text = std::mem::take(&mut self.buffer);
        let utterance = Utterance {
            text,
            confidence: self.confidence_sum / self.fragment_count as f64,
            start_time: self.start_time,
            end_time: self.end_time,
            language: self.language.take(),
            finalized_at: Utc::now(),
        };

        self.confidence_sum = 0.0;
        self.fragment_count = 0;
        self.start_time = 0.0;
        self.end_time = 0.0;
        self.last_fragment_at = None;

        Some(utterance)
    }
}
