use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use roomscribe_db::ConferenceServer;
use serde::Serialize;

use crate::ConferenceError;

/// Join-token lifetime. Long enough for any single room; the token is
/// minted per join, never reused.
const TOKEN_TTL_SECONDS: i64 = 6 * 60 * 60;

#[derive(Debug, Serialize)]
struct RoomGrant {
    room: String,
    room_join: bool,
    can_publish: bool,
    can_subscribe: bool,
    hidden: bool,
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    sub: String,
    nbf: i64,
    exp: i64,
    metadata: String,
    grant: RoomGrant,
}

/// Mints a short-lived HS256 credential asserting: join this room, never
/// publish, subscribe to everything, stay hidden.
pub fn mint_join_token(
    server: &ConferenceServer,
    room_name: &str,
    identity: &str,
) -> Result<String, ConferenceError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        iss: server.api_key.clone(),
        sub: identity.to_string(),
        nbf: now - 10,
        exp: now + TOKEN_TTL_SECONDS,
        metadata: crate::worker_metadata().to_string(),
        grant: RoomGrant {
            room: room_name.to_string(),
            room_join: true,
            can_publish: false,
            can_subscribe: true,
            hidden: true,
        },
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(server.api_secret.as_bytes()),
    )?;
    Ok(token)
}
