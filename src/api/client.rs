//! HTTP client with bearer injection and refresh-and-retry on 401.
//!
//! Every call made through [`ApiClient::execute`] runs through two hooks:
//! the outbound hook attaches `Authorization: Bearer <access>` unless the
//! caller already set a credential, and the inbound hook turns a first 401
//! into one coordinated token refresh followed by a single resend. Login and
//! the refresh call itself go through [`RawClient`], which has no hooks.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

use super::error::ApiError;
use super::refresh::RefreshCoordinator;
use super::tokens::TokenStore;
use super::types::envelope_message;

/// Whole-request timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Connect timeout used when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<Value>,
    headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Supply an explicit credential; the outbound hook leaves it alone.
    pub fn bearer(self, token: &str) -> Result<Self, ApiError> {
        let value = bearer_value(token)?;
        Ok(self.header(AUTHORIZATION, value))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A successful (2xx) response with its decoded body.
///
/// `body` is `Null` for an empty body and a JSON string when the server
/// answered with something other than JSON.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

/// A request on its way through the pipeline, plus the retry marker.
#[derive(Debug)]
struct Attempt {
    request: ApiRequest,
    retried: bool,
    /// Stored access token the outbound hook attached. `None` when the
    /// caller supplied its own credential or no token was stored.
    injected: Option<String>,
}

impl Attempt {
    fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retried: false,
            injected: None,
        }
    }

    fn set_bearer(&mut self, token: String) -> Result<(), ApiError> {
        self.request
            .headers
            .insert(AUTHORIZATION, bearer_value(&token)?);
        self.injected = Some(token);
        Ok(())
    }
}

/// Plain client bound to the API base URL, without auth hooks.
#[derive(Debug, Clone)]
pub struct RawClient {
    client: Client,
    base_url: String,
}

impl RawClient {
    pub fn new(base_url: &str, timeout: Duration, connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .header(ACCEPT, "application/json")
            .headers(request.headers.clone());

        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        Ok(builder.send().await?)
    }

    /// Send a request and decode the response, with no token handling at all.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let resp = self.send(&request).await?;
        read_response(resp).await
    }

    /// POST a JSON body without authorization.
    pub async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::post(path).json(body)?).await
    }
}

/// Authenticated API client.
///
/// Cheap to share behind an `Arc`; the token store and refresh coordinator are
/// shared by every request issued through it.
pub struct ApiClient {
    raw: RawClient,
    tokens: Arc<TokenStore>,
    refresher: RefreshCoordinator,
}

impl ApiClient {
    /// Create a client with the default timeouts.
    pub fn new(base_url: &str, tokens: Arc<TokenStore>) -> Self {
        Self::with_timeouts(base_url, tokens, DEFAULT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeouts(
        base_url: &str,
        tokens: Arc<TokenStore>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        let raw = RawClient::new(base_url, timeout, connect_timeout);
        let refresher = RefreshCoordinator::new(raw.clone(), tokens.clone());
        Self {
            raw,
            tokens,
            refresher,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Client that bypasses both hooks (login, refresh).
    pub fn raw(&self) -> &RawClient {
        &self.raw
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    /// Send a request through the auth pipeline.
    ///
    /// A 401 triggers at most one refresh and one resend; the resend's outcome
    /// is returned. Other statuses and transport errors are returned as is.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut attempt = Attempt::new(request);
        loop {
            self.authorize(&mut attempt)?;
            let resp = self.raw.send(&attempt.request).await?;

            if resp.status() != StatusCode::UNAUTHORIZED {
                return read_response(resp).await.inspect(|ok| {
                    log::debug!(
                        "{} {} -> {}",
                        attempt.request.method,
                        attempt.request.path,
                        ok.status
                    );
                });
            }

            let failure = read_failure(resp).await;
            self.on_unauthorized(&mut attempt, failure).await?;
        }
    }

    /// Outbound hook.
    fn authorize(&self, attempt: &mut Attempt) -> Result<(), ApiError> {
        if attempt.request.headers.contains_key(AUTHORIZATION) {
            return Ok(());
        }
        match self.tokens.access_token() {
            Some(token) => attempt.set_bearer(token),
            None => Ok(()),
        }
    }

    /// Inbound 401 hook. `Ok(())` means the attempt carries a fresh
    /// credential and should be resent; otherwise the failure is returned.
    async fn on_unauthorized(&self, attempt: &mut Attempt, failure: ApiError) -> Result<(), ApiError> {
        if attempt.retried {
            log::warn!(
                "{} {} still unauthorized after refresh, clearing session",
                attempt.request.method,
                attempt.request.path
            );
            self.tokens.clear_tokens();
            return Err(failure);
        }
        attempt.retried = true;

        // Only a credential taken from the store can have been rotated since
        match self.refresher.refresh_after(attempt.injected.as_deref()).await {
            Some(access) => {
                log::debug!(
                    "Retrying {} {} with refreshed token",
                    attempt.request.method,
                    attempt.request.path
                );
                attempt.set_bearer(access)
            }
            None => {
                self.tokens.clear_tokens();
                Err(failure)
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::get(path)).await
    }

    pub async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::post(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::delete(path)).await
    }
}

fn bearer_value(token: &str) -> Result<HeaderValue, ApiError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| ApiError::Validation("access token contains invalid characters".into()))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Decode a response body and map non-2xx statuses onto [`ApiError`].
async fn read_response(resp: Response) -> Result<ApiResponse, ApiError> {
    let status = resp.status();
    let text = resp.text().await?;
    let body = parse_body(&text);

    if status.is_success() {
        Ok(ApiResponse { status, body })
    } else {
        Err(status_error(status, &text, &body))
    }
}

/// Read a response already known to be a failure.
async fn read_failure(resp: Response) -> ApiError {
    let status = resp.status();
    match resp.text().await {
        Ok(text) => status_error(status, &text, &parse_body(&text)),
        Err(e) => ApiError::Transport(e),
    }
}

fn status_error(status: StatusCode, text: &str, body: &Value) -> ApiError {
    let message = envelope_message(body)
        .or_else(|| Some(text.trim().to_string()).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("no reason").to_string());

    if status == StatusCode::UNAUTHORIZED {
        ApiError::Unauthorized { message }
    } else {
        ApiError::Status { status, message }
    }
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
