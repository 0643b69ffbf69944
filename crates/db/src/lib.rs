pub mod models;

pub use models::{
    AnalysisJob, ConferenceServer, JobStatus, Participant, Room, RoomStatus, SttSession,
    SttSessionStatus, TranscriptRow, Worker, WorkerMode, WorkerStatus,
};
