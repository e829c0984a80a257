//! Request and response types for the student portal backend API.
//!
//! The backend wraps every payload in a `{message, data}` envelope. Helpers
//! here accept either the nested `data` field or the top-level body, and both
//! the short (`access`) and long (`access_token`) token field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Login request body sent to POST /api/auth/login/.
#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Body sent to POST /api/auth/refresh-token/ and POST /api/auth/logout/.
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: Option<&'a str>,
}

/// Access/refresh token pair as issued by the login endpoint.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

/// Return the meaningful payload of an envelope: `data` when present and
/// non-null, otherwise the body itself.
pub fn envelope_payload(body: &Value) -> &Value {
    match body.get("data") {
        Some(data) if !data.is_null() => data,
        _ => body,
    }
}

/// Like [`envelope_payload`], but `None` when the body itself is empty.
pub fn envelope_data(body: Value) -> Option<Value> {
    let payload = match body {
        Value::Object(mut map) => match map.remove("data") {
            Some(data) if !data.is_null() => data,
            Some(_) | None => Value::Object(map),
        },
        other => other,
    };
    (!payload.is_null()).then_some(payload)
}

/// The envelope's `message` field, if the backend supplied one.
pub fn envelope_message(body: &Value) -> Option<String> {
    body.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Tokens found in a login or refresh response, either of which may be absent.
#[derive(Debug, Default)]
pub struct IssuedTokens {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

impl IssuedTokens {
    /// Extract tokens from a response body.
    pub fn from_body(body: &Value) -> Self {
        let payload = envelope_payload(body);
        Self {
            access: string_field(payload, &["access", "access_token"]),
            refresh: string_field(payload, &["refresh", "refresh_token"]),
        }
    }
}

fn string_field(payload: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| payload.get(*name))
        .find_map(|value| value.as_str().filter(|s| !s.is_empty()))
        .map(str::to_string)
}

/// Typed view over the user-details payload.
///
/// Backends differ in which profile fields they fill in, so every field is
/// optional and the accessors fall back across the known aliases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    user: Option<NestedUser>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    profile_pic: Option<String>,
    #[serde(default)]
    passport_photo: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NestedUser {
    #[serde(default)]
    id: Option<Value>,
}

impl UserProfile {
    /// User id from `id`, else from a nested `user.id`.
    pub fn id(&self) -> Option<String> {
        self.id
            .as_ref()
            .and_then(id_string)
            .or_else(|| self.user.as_ref()?.id.as_ref().and_then(id_string))
    }

    /// `full_name`, else `first_name last_name` when either is set.
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.full_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return Some(name.trim().to_string());
        }
        let joined = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        );
        let joined = joined.trim();
        (!joined.is_empty()).then(|| joined.to_string())
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone_number.as_deref().or(self.phone.as_deref())
    }

    pub fn picture(&self) -> Option<&str> {
        self.profile_pic.as_deref().or(self.passport_photo.as_deref())
    }
}

/// Render an identifier claim or field as a string. Strings are returned
/// verbatim and numbers in decimal; anything else is not an identifier.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
