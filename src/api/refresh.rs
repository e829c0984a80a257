//! Single-flight access token refresh.
//!
//! At most one refresh call is in flight. Callers arriving while one is
//! outstanding subscribe to its outcome instead of starting another. The
//! refresh itself runs on a spawned task, so a caller that gets cancelled
//! does not strand the others waiting on it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::client::RawClient;
use super::tokens::TokenStore;
use super::types::{IssuedTokens, RefreshRequest};

/// Outcome of one refresh: the new access token, or `None` on failure.
type Outcome = Option<String>;

enum RefreshState {
    Idle,
    /// Receives `Some(outcome)` once the in-flight refresh settles.
    Refreshing(watch::Receiver<Option<Outcome>>),
}

enum Joined {
    Waiting(watch::Receiver<Option<Outcome>>),
    /// The token was rotated after the caller's request went out.
    Rotated(String),
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    raw: RawClient,
    tokens: Arc<TokenStore>,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new(raw: RawClient, tokens: Arc<TokenStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                raw,
                tokens,
                state: Mutex::new(RefreshState::Idle),
            }),
        }
    }

    /// Refresh the access token, joining any refresh already in flight.
    pub async fn refresh_tokens(&self) -> Option<String> {
        self.refresh_after(None).await
    }

    /// Refresh on behalf of a request rejected while carrying `stale`.
    ///
    /// If no refresh is running and the stored access token is already
    /// different from `stale`, a refresh settled after that request was sent;
    /// the current token is returned without another network call.
    pub async fn refresh_after(&self, stale: Option<&str>) -> Option<String> {
        let mut rx = match self.join_or_start(stale) {
            Joined::Waiting(rx) => rx,
            Joined::Rotated(current) => return Some(current),
        };

        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone().flatten());
        settled.unwrap_or_else(|_| {
            log::warn!("Token refresh ended without an outcome");
            None
        })
    }

    /// Whether a refresh call is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock_state(), RefreshState::Refreshing(ref rx) if rx.has_changed().is_ok())
    }

    fn join_or_start(&self, stale: Option<&str>) -> Joined {
        let mut state = self.inner.lock_state();

        if let RefreshState::Refreshing(ref rx) = *state {
            // A closed channel means the refresh task died; start over
            if rx.has_changed().is_ok() {
                log::debug!("Joining in-flight token refresh");
                return Joined::Waiting(rx.clone());
            }
        }

        if let (Some(stale), Some(current)) = (stale, self.inner.tokens.access_token()) {
            if stale != current {
                log::debug!("Access token already rotated, skipping refresh");
                return Joined::Rotated(current);
            }
        }

        let (tx, rx) = watch::channel(None);
        *state = RefreshState::Refreshing(rx.clone());
        drop(state);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner.perform().await;
            inner.settle(tx, outcome);
        });

        Joined::Waiting(rx)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return to idle first so the next failure can start a new refresh,
    /// then publish the outcome to everyone waiting.
    fn settle(&self, tx: watch::Sender<Option<Outcome>>, outcome: Outcome) {
        *self.lock_state() = RefreshState::Idle;
        let _ = tx.send(Some(outcome));
    }

    async fn perform(&self) -> Outcome {
        let Some(refresh) = self.tokens.refresh_token() else {
            log::info!("No refresh token stored, session ended");
            self.tokens.clear_tokens();
            return None;
        };

        log::debug!("Refreshing access token");
        let request = RefreshRequest {
            refresh: Some(&refresh),
        };

        let resp = match self.raw.post("/api/auth/refresh-token/", &request).await {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!("Token refresh failed: {}", e);
                self.tokens.clear_tokens();
                return None;
            }
        };

        let issued = IssuedTokens::from_body(&resp.body);
        let Some(access) = issued.access else {
            log::warn!("Token refresh response carried no access token");
            self.tokens.clear_tokens();
            return None;
        };

        // Keep the previous refresh token unless a rotated one was issued
        let refresh = issued.refresh.unwrap_or(refresh);
        self.tokens.set_tokens(&access, &refresh);
        log::info!("Access token refreshed");
        Some(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT};
    use crate::api::storage::MemoryStorage;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use tokio::task::JoinSet;

    fn coordinator(url: &str) -> (RefreshCoordinator, Arc<TokenStore>) {
        let tokens = Arc::new(TokenStore::new(MemoryStorage::default()));
        let raw = RawClient::new(url, DEFAULT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT);
        (RefreshCoordinator::new(raw, tokens.clone()), tokens)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let mut server = Server::new_async().await;
        let refresh_mock = server
            .mock("POST", "/api/auth/refresh-token/")
            .match_body(Matcher::Json(json!({"refresh": "R1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"ok","data":{"access":"A2"}}"#)
            .expect(1)
            .create_async()
            .await;

        let (coordinator, tokens) = coordinator(&server.url());
        tokens.set_tokens("A1", "R1");

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            set.spawn(async move { coordinator.refresh_tokens().await });
        }

        let mut results = Vec::new();
        while let Some(result) = set.join_next().await {
            results.push(result.unwrap());
        }

        refresh_mock.assert_async().await;
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.as_deref() == Some("A2")));
        assert_eq!(tokens.access_token().as_deref(), Some("A2"));
        assert_eq!(tokens.refresh_token().as_deref(), Some("R1"));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_stored() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/auth/refresh-token/")
            .with_status(200)
            .with_body(r#"{"access_token":"A2","refresh_token":"R2"}"#)
            .create_async()
            .await;

        let (coordinator, tokens) = coordinator(&server.url());
        tokens.set_tokens("A1", "R1");

        assert_eq!(coordinator.refresh_tokens().await.as_deref(), Some("A2"));
        assert_eq!(tokens.refresh_token().as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_makes_no_call() {
        let mut server = Server::new_async().await;
        let refresh_mock = server
            .mock("POST", "/api/auth/refresh-token/")
            .expect(0)
            .create_async()
            .await;

        let (coordinator, tokens) = coordinator(&server.url());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = tokens.subscribe(move |logged_in| sink.lock().unwrap().push(logged_in));

        assert_eq!(coordinator.refresh_tokens().await, None);
        refresh_mock.assert_async().await;
        assert_eq!(*events.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_response_without_access_clears_tokens() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/auth/refresh-token/")
            .with_status(200)
            .with_body(r#"{"message":"ok","data":{}}"#)
            .create_async()
            .await;

        let (coordinator, tokens) = coordinator(&server.url());
        tokens.set_tokens("A1", "R1");

        assert_eq!(coordinator.refresh_tokens().await, None);
        assert_eq!(tokens.access_token(), None);
        assert_eq!(tokens.refresh_token(), None);
        assert!(!tokens.is_authenticated());
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_tokens() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/auth/refresh-token/")
            .with_status(401)
            .with_body(r#"{"message":"Token is blacklisted"}"#)
            .create_async()
            .await;

        let (coordinator, tokens) = coordinator(&server.url());
        tokens.set_tokens("A1", "R1");

        assert_eq!(coordinator.refresh_tokens().await, None);
        assert_eq!(tokens.access_token(), None);
    }

    #[tokio::test]
    async fn test_unreachable_server_clears_tokens() {
        // Port 9 (discard) on localhost is not expected to accept connections
        let (coordinator, tokens) = coordinator("http://127.0.0.1:9");
        tokens.set_tokens("A1", "R1");

        assert_eq!(coordinator.refresh_tokens().await, None);
        assert_eq!(tokens.refresh_token(), None);
    }

    #[tokio::test]
    async fn test_settled_refresh_allows_a_new_one() {
        let mut server = Server::new_async().await;
        let refresh_mock = server
            .mock("POST", "/api/auth/refresh-token/")
            .with_status(200)
            .with_body(r#"{"data":{"access":"A2"}}"#)
            .expect(2)
            .create_async()
            .await;

        let (coordinator, tokens) = coordinator(&server.url());
        tokens.set_tokens("A1", "R1");

        assert_eq!(coordinator.refresh_tokens().await.as_deref(), Some("A2"));
        assert_eq!(coordinator.refresh_tokens().await.as_deref(), Some("A2"));
        refresh_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stale_credential_reuses_rotated_token() {
        let mut server = Server::new_async().await;
        let refresh_mock = server
            .mock("POST", "/api/auth/refresh-token/")
            .expect(0)
            .create_async()
            .await;

        let (coordinator, tokens) = coordinator(&server.url());
        tokens.set_tokens("A2", "R1");

        assert_eq!(coordinator.refresh_after(Some("A1")).await.as_deref(), Some("A2"));
        refresh_mock.assert_async().await;
    }
}
