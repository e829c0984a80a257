//! Account operations: login, logout, profile lookup, account deletion.

use serde_json::Value;

use super::client::ApiClient;
use super::error::ApiError;
use super::types::{envelope_data, IssuedTokens, LoginRequest, RefreshRequest, TokenPair, UserProfile};

/// Exchange email and password for a token pair and persist it.
///
/// POST /api/auth/login/ without an Authorization header.
pub async fn login(client: &ApiClient, email: &str, password: &str) -> Result<TokenPair, ApiError> {
    validate_credentials(email, password)?;
    let email = email.trim();

    let resp = client
        .raw()
        .post("/api/auth/login/", &LoginRequest { email, password })
        .await?;

    let issued = IssuedTokens::from_body(&resp.body);
    let (Some(access), Some(refresh)) = (issued.access, issued.refresh) else {
        return Err(ApiError::IncompleteCredentials);
    };

    client.tokens().set_tokens(&access, &refresh);
    log::info!("Login successful");
    Ok(TokenPair { access, refresh })
}

fn validate_credentials(email: &str, password: &str) -> Result<(), ApiError> {
    let email = email.trim();
    let valid_email = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid_email {
        return Err(ApiError::Validation(
            "Please enter a valid email address".into(),
        ));
    }
    if password.is_empty() {
        return Err(ApiError::Validation("Password is required".into()));
    }
    Ok(())
}

/// Invalidate the session server-side (best-effort) and always clear local tokens.
///
/// POST /api/auth/logout/ {refresh}
pub async fn logout(client: &ApiClient) {
    let refresh = client.tokens().refresh_token();
    let body = RefreshRequest {
        refresh: refresh.as_deref(),
    };

    if let Err(e) = client.post("/api/auth/logout/", &body).await {
        log::warn!("Logout request failed (will continue local cleanup): {}", e);
    }

    client.tokens().clear_tokens();
    log::info!("Logout complete");
}

/// Fetch the current user's details.
///
/// GET /api/auth/user-details/. Returns the envelope's `data`, else the raw
/// body, else `None` for an empty response.
pub async fn current_user(client: &ApiClient) -> Result<Option<Value>, ApiError> {
    let resp = client.get("/api/auth/user-details/").await?;
    Ok(envelope_data(resp.body))
}

/// [`current_user`] decoded into a [`UserProfile`].
pub async fn current_profile(client: &ApiClient) -> Result<Option<UserProfile>, ApiError> {
    match current_user(client).await? {
        Some(data) => Ok(Some(serde_json::from_value(data)?)),
        None => Ok(None),
    }
}

/// Delete the student's account.
///
/// DELETE /api/auth/delete-user/{id}/. The id is `user_id` if given, else the
/// id claim of the stored access token. An explicit empty id is rejected. Tokens are cleared once the server
/// confirms the deletion.
pub async fn delete_account(client: &ApiClient, user_id: Option<&str>) -> Result<Option<Value>, ApiError> {
    let id = match user_id {
        Some("") => return Err(ApiError::MissingUserId),
        Some(id) => id.to_string(),
        None => client.tokens().user_id().ok_or(ApiError::MissingUserId)?,
    };

    let path = format!("/api/auth/delete-user/{}/", urlencoding::encode(&id));
    let resp = client.delete(&path).await?;

    log::info!("Account {} deleted", id);
    client.tokens().clear_tokens();
    Ok(envelope_data(resp.body))
}

/// Client-side session guard for pages that need a logged-in user.
///
/// Returns `false` and drops any stale tokens when the stored access token is
/// missing or expired.
pub fn ensure_session(client: &ApiClient) -> bool {
    if client.tokens().is_authenticated() {
        return true;
    }
    client.tokens().clear_tokens();
    false
}

/// Explicitly refresh the access token from the stored refresh token.
pub async fn refresh_session(client: &ApiClient) -> Result<String, ApiError> {
    if client.tokens().refresh_token().is_none() {
        return Err(ApiError::MissingRefreshToken);
    }
    client
        .refresher()
        .refresh_tokens()
        .await
        .ok_or_else(|| ApiError::Unauthorized {
            message: "Session expired; log in again".into(),
        })
}
