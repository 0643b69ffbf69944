//! Typed operations over the coordination store.
//!
//! The store is the single source of truth for room ownership; workers keep
//! only ephemeral in-memory state. Everything here goes through the
//! [`StoreGateway`] trait so the full stack can run against an in-memory
//! implementation in tests.

pub mod gateway;
pub mod pg;
pub mod timebase;

pub use gateway::{
    NewTranscript, SessionClose, StoreError, StoreGateway, StoreResult, CLAIM_STALE_AFTER,
};
pub use pg::PgStore;
pub use timebase::{Timebase, TimebaseError};
