//! Visitor and session identity.
//!
//! The visitor id is a fingerprint hash kept in durable storage under `_vid`.
//! The session id lives in volatile storage under `_sid` together with its
//! last-activity time and slides forward on every read until a gap of
//! `timeout` elapses, after which a new session is minted. Old sessions are
//! never revived or merged.

use crate::env::{DeviceInfo, Environment};
use crate::hash::{hash_string, to_base36};
use crate::types::{Identity, SessionRecord};

/// Durable storage key for the visitor id
pub const VISITOR_KEY: &str = "_vid";
/// Volatile storage key for the session record
pub const SESSION_KEY: &str = "_sid";

/// Characters of the canvas signature mixed into the fingerprint
const CANVAS_TAIL_LEN: usize = 50;

/// Resolves visitor and session ids against an [`Environment`].
#[derive(Debug, Clone, Copy)]
pub struct IdentityProvider {
    session_timeout_ms: i64,
    use_canvas: bool,
}

impl IdentityProvider {
    pub fn new(session_timeout_ms: i64, use_canvas: bool) -> Self {
        Self {
            session_timeout_ms,
            use_canvas,
        }
    }

    pub fn resolve(&self, env: &dyn Environment) -> Identity {
        Identity {
            visitor_id: self.visitor_id(env),
            session_id: self.session_id(env),
        }
    }

    /// Stored visitor id, or a freshly derived and persisted one.
    pub fn visitor_id(&self, env: &dyn Environment) -> String {
        if let Some(existing) = env.durable_get(VISITOR_KEY).filter(|v| !v.is_empty()) {
            return existing;
        }

        let visitor_id = hash_string(&fingerprint(&env.device(), self.use_canvas));
        env.durable_set(VISITOR_KEY, &visitor_id);
        tracing::debug!(visitor_id = %visitor_id, "Derived new visitor id");
        visitor_id
    }

    /// Current session id, extending its lifetime, or a new one if expired.
    pub fn session_id(&self, env: &dyn Environment) -> String {
        let now = env.now_ms();

        if let Some(record) = env.volatile_get(SESSION_KEY).and_then(|raw| parse_session(&raw)) {
            if now - record.last_active < self.session_timeout_ms {
                store_session(env, &record.id, now);
                return record.id;
            }
            tracing::debug!(session_id = %record.id, "Session expired");
        }

        let id = format!("{}-{}", now, random_suffix());
        store_session(env, &id, now);
        tracing::debug!(session_id = %id, "Started new session");
        id
    }
}

/// Join device signals in fixed order.
fn fingerprint(device: &DeviceInfo, use_canvas: bool) -> String {
    let mut parts = vec![
        device.user_agent.clone(),
        device.language.clone(),
        device.screen_width.to_string(),
        device.screen_height.to_string(),
        device.timezone_offset_minutes.to_string(),
    ];

    if use_canvas {
        if let Some(signature) = &device.canvas_signature {
            parts.push(tail(signature, CANVAS_TAIL_LEN).to_string());
        }
    }

    parts.join("|")
}

fn tail(s: &str, n: usize) -> &str {
    let start = s
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[start..]
}

fn parse_session(raw: &str) -> Option<SessionRecord> {
    match serde_json::from_str::<SessionRecord>(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!(error = %e, "Discarding malformed session record");
            None
        }
    }
}

fn store_session(env: &dyn Environment, id: &str, now: i64) {
    let record = SessionRecord {
        id: id.to_string(),
        last_active: now,
    };
    match serde_json::to_string(&record) {
        Ok(json) => env.volatile_set(SESSION_KEY, &json),
        Err(e) => tracing::warn!(error = %e, "Failed to encode session record"),
    }
}

/// Eleven base-36 characters of randomness.
fn random_suffix() -> String {
    let mut suffix = to_base36(uuid::Uuid::new_v4().as_u128());
    suffix.truncate(11);
    suffix
}
