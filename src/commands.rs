//! Command handlers for the `student-portal` CLI.
//!
//! Each handler drives one account operation and prints a short result.
//! Errors come back as display strings for `main` to report.

use student_portal::api::{account, ApiClient, ApiError};

/// Log in with email and password.
pub async fn login(client: &ApiClient, email: &str, password: &str) -> Result<(), String> {
    log::info!("Logging in");

    account::login(client, email, password)
        .await
        .map_err(|e| match e {
            ApiError::Unauthorized { .. } => {
                "Invalid credentials. Please check your email and password.".to_string()
            }
            other => format!("Login failed: {}", other),
        })?;

    match client.tokens().user_id() {
        Some(id) => println!("Logged in as {} (user {})", email.trim(), id),
        None => println!("Logged in as {}", email.trim()),
    }
    Ok(())
}

/// Log out. Local tokens are removed even if the server is unreachable.
pub async fn logout(client: &ApiClient) -> Result<(), String> {
    account::logout(client).await;
    println!("Logged out");
    Ok(())
}

/// Try to silently restore an expired session from the stored refresh token.
async fn try_silent_refresh(client: &ApiClient) {
    if client.tokens().is_authenticated() {
        return;
    }
    if client.tokens().refresh_token().is_none() {
        log::info!("No stored refresh token, silent refresh skipped");
        return;
    }
    match account::refresh_session(client).await {
        Ok(_) => log::info!("Silent refresh successful"),
        Err(e) => log::warn!("Silent refresh failed: {}", e),
    }
}

/// Print the logged-in student's profile.
pub async fn whoami(client: &ApiClient, raw_json: bool) -> Result<(), String> {
    try_silent_refresh(client).await;
    if !account::ensure_session(client) {
        return Err("Not logged in. Run `student-portal login` first.".to_string());
    }

    if raw_json {
        let user = account::current_user(client)
            .await
            .map_err(|e| format!("Failed to load profile: {}", e))?;
        let rendered = serde_json::to_string_pretty(&user.unwrap_or_default())
            .map_err(|e| format!("Failed to render profile: {}", e))?;
        println!("{}", rendered);
        return Ok(());
    }

    let profile = account::current_profile(client)
        .await
        .map_err(|e| format!("Failed to load profile: {}", e))?
        .unwrap_or_default();

    println!("Name:    {}", profile.display_name().unwrap_or_else(|| "Student".to_string()));
    println!("Email:   {}", profile.email.as_deref().unwrap_or("No email provided"));
    println!("Phone:   {}", profile.phone().unwrap_or("No phone provided"));
    if let Some(id) = profile.id().or_else(|| client.tokens().user_id()) {
        println!("User ID: {}", id);
    }
    if let Some(picture) = profile.picture() {
        println!("Photo:   {}", picture);
    }
    Ok(())
}

/// Print the local session state without contacting the server.
pub fn status(client: &ApiClient) -> Result<(), String> {
    let tokens = client.tokens();
    if tokens.access_token().is_none() {
        println!("Not logged in");
        return Ok(());
    }

    let state = if tokens.is_authenticated() { "active" } else { "expired" };
    println!("Session: {}", state);
    if let Some(id) = tokens.user_id() {
        println!("User ID: {}", id);
    }
    if let Some(exp) = tokens.claims().and_then(|claims| claims.exp()) {
        println!("Expires: {} (unix time)", exp as u64);
    }
    println!(
        "Refresh token: {}",
        if tokens.refresh_token().is_some() { "stored" } else { "missing" }
    );
    Ok(())
}

/// Exchange the stored refresh token for a new access token.
pub async fn refresh(client: &ApiClient) -> Result<(), String> {
    account::refresh_session(client)
        .await
        .map_err(|e| format!("Refresh failed: {}", e))?;
    println!("Session refreshed");
    Ok(())
}

/// Permanently delete the account. Requires explicit confirmation.
pub async fn delete_account(
    client: &ApiClient,
    user_id: Option<String>,
    confirmed: bool,
) -> Result<(), String> {
    if !confirmed {
        return Err(
            "Deleting your account is permanent. Re-run with --yes to confirm.".to_string(),
        );
    }

    // Token claim first, then whatever id the profile reports
    let user_id = match user_id.or_else(|| client.tokens().user_id()) {
        Some(id) => Some(id),
        None => account::current_profile(client)
            .await
            .map_err(|e| format!("Failed to load profile: {}", e))?
            .and_then(|profile| profile.id()),
    };

    account::delete_account(client, user_id.as_deref())
        .await
        .map_err(|e| format!("Failed to delete account: {}", e))?;

    println!("Account deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use mockito::Server;
    use student_portal::api::storage::MemoryStorage;
    use student_portal::api::TokenStore;

    fn token(payload: &str) -> String {
        format!("e30.{}.sig", URL_SAFE_NO_PAD.encode(payload))
    }

    fn client_for(url: &str) -> ApiClient {
        ApiClient::new(url, Arc::new(TokenStore::new(MemoryStorage::default())))
    }

    #[tokio::test]
    async fn test_whoami_refreshes_expired_session() {
        let mut server = Server::new_async().await;
        let refresh_mock = server
            .mock("POST", "/api/auth/refresh-token/")
            .with_status(200)
            .with_body(format!(r#"{{"data":{{"access":"{}"}}}}"#, token(r#"{"exp":4102444800}"#)))
            .expect(1)
            .create_async()
            .await;
        let _profile = server
            .mock("GET", "/api/auth/user-details/")
            .with_status(200)
            .with_body(r#"{"data":{"id":"stu-1","full_name":"Ada"}}"#)
            .create_async()
            .await;

        let client = client_for(&server.url());
        client.tokens().set_tokens(&token(r#"{"exp":1}"#), "R1");

        assert!(whoami(&client, false).await.is_ok());
        refresh_mock.assert_async().await;
        assert!(client.tokens().is_authenticated());
    }

    #[tokio::test]
    async fn test_whoami_fails_when_refresh_is_rejected() {
        let mut server = Server::new_async().await;
        let _refresh = server
            .mock("POST", "/api/auth/refresh-token/")
            .with_status(401)
            .with_body(r#"{"message":"Token is blacklisted"}"#)
            .create_async()
            .await;
        let profile = server
            .mock("GET", "/api/auth/user-details/")
            .expect(0)
            .create_async()
            .await;

        let client = client_for(&server.url());
        client.tokens().set_tokens(&token(r#"{"exp":1}"#), "R1");

        assert!(whoami(&client, false).await.is_err());
        profile.assert_async().await;
        assert_eq!(client.tokens().access_token(), None);
    }
}
