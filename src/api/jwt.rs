//! Best-effort JWT payload decoding.
//!
//! Decodes the payload segment (base64url) without verifying the signature.
//! The server is the only party that verifies tokens; the client reads claims
//! purely for convenience (user id lookup, expiry hints) and must never use
//! them to make an authorization decision.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use serde_json::{Map, Value};

use super::types::id_string;

/// Claims decoded from an access token payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// First non-null value among `user_id`, `sub`, `id`.
    pub fn user_id(&self) -> Option<String> {
        ["user_id", "sub", "id"]
            .iter()
            .filter_map(|name| self.0.get(*name))
            .find(|value| !value.is_null())
            .and_then(id_string)
    }

    /// Expiry in seconds since the epoch. Zero or a non-numeric claim counts
    /// as no expiry.
    pub fn exp(&self) -> Option<f64> {
        self.0
            .get("exp")
            .and_then(Value::as_f64)
            .filter(|exp| *exp != 0.0)
    }

    /// Whether the token is still live at `now` (seconds since the epoch).
    /// Tokens without an expiry are treated as live.
    pub fn is_live_at(&self, now: f64) -> bool {
        match self.exp() {
            Some(exp) => now < exp,
            None => true,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

/// Decode the payload segment of a JWT.
///
/// Returns `None` for anything malformed: fewer than two segments, invalid
/// base64, or a payload that is not a JSON object.
pub fn decode_jwt_payload(token: &str) -> Option<Claims> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;

    // base64url: replace - with + and _ with /, then add padding
    let mut standard = payload.replace('-', "+").replace('_', "/");
    while standard.len() % 4 != 0 {
        standard.push('=');
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(standard.as_bytes())
        .ok()?;

    match serde_json::from_slice::<Value>(&decoded).ok()? {
        Value::Object(map) => Some(Claims(map)),
        _ => None,
    }
}

/// Current time in fractional seconds since the epoch.
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
