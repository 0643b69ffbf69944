use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::gateway::{StoreGateway, StoreResult};

#[derive(Debug, thiserror::Error)]
#[error("timebase used before initialize()")]
pub struct TimebaseError;

/// Per-room monotonic timebase.
///
/// The first owner of a room establishes `t0`; every successor loads the
/// same value, so transcript timestamps stay on one axis across worker
/// crashes.
#[derive(Debug, Clone)]
pub struct Timebase {
    room_id: Uuid,
    origin: Option<DateTime<Utc>>,
}

impl Timebase {
    pub fn new(room_id: Uuid) -> Self {
        Self {
            room_id,
            origin: None,
        }
    }

    /// Loads the room's origin, or establishes it with a set-if-null
    /// write. A losing contender adopts whatever the winner stored.
    /// Idempotent: repeat calls return the same instant.
    pub async fn initialize(&mut self, store: &dyn StoreGateway) -> StoreResult<DateTime<Utc>> {
        if let Some(origin) = self.origin {
            return Ok(origin);
        }

        let existing = store
            .get_room(self.room_id)
            .await?
            .and_then(|room| room.timebase_origin);

        let origin = match existing {
            Some(origin) => {
                info!(room_id = %self.room_id, %origin, "Adopted existing timebase origin");
                origin
            }
            None => {
                let stored = store.set_timebase_if_null(self.room_id, Utc::now()).await?;
                info!(room_id = %self.room_id, origin = %stored, "Timebase origin established");
                stored
            }
        };

        self.origin = Some(origin);
        Ok(origin)
    }

    pub fn origin(&self) -> Option<DateTime<Utc>> {
        self.origin
    }

    /// Seconds from the room origin to `at` (or to now).
    pub fn relative(&self, at: Option<DateTime<Utc>>) -> Result<f64, TimebaseError> {
        let origin = self.origin.ok_or(TimebaseError)?;
        let at = at.unwrap_or_else(Utc::now);
        Ok((at - origin).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0)
    }
}
