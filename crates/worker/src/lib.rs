//! The worker process: claims one room at a time, drives its
//! transcription pipelines, finalizes it, and loops.

pub mod discovery;
pub mod health;
pub mod jobs;
pub mod manager;
pub mod room;

pub use discovery::{ClaimCache, ClaimedRoom, DiscoveryMethod, RoomDiscovery};
pub use manager::WorkerManager;
