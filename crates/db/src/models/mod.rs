pub mod analysis_job;
pub mod conference_server;
pub mod participant;
pub mod room;
pub mod stt_session;
pub mod transcript;
pub mod worker;

pub use analysis_job::{AnalysisJob, JobStatus};
pub use conference_server::ConferenceServer;
pub use participant::Participant;
pub use room::{Room, RoomStatus};
pub use stt_session::{SttSession, SttSessionStatus};
pub use transcript::TranscriptRow;
pub use worker::{Worker, WorkerMode, WorkerStatus};
