//! Bidirectional streaming client for the external transcription provider.
//!
//! Outbound: one `StartRecognition` control frame, then raw PCM binary
//! frames, then an empty payload as the end-of-stream sentinel. Inbound:
//! JSON control frames tagged by their `message` field.

pub mod client;
pub mod messages;

pub use client::{AudioLane, SttError, SttStreamClient};
pub use messages::{
    Alternative, AudioFormat, ClientMessage, RecognitionConfig, ServerMessage, TranscriptMetadata,
    TranscriptPayload, TranscriptResult,
};
