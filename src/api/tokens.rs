//! Token store: the single owner of the persisted access/refresh pair.
//!
//! Storage failures are logged and swallowed; a missing medium only costs
//! persistence, never the correctness of the current session. Observers are
//! told about every transition between "tokens present" and "tokens absent"
//! after the write has been applied.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::jwt::{decode_jwt_payload, now_seconds, Claims};
use super::storage::{StorageError, TokenStorage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

/// Callback invoked with `true` on login/refresh and `false` on logout.
pub type AuthObserver = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    callbacks: HashMap<u64, AuthObserver>,
}

/// Handle returned by [`TokenStore::subscribe`].
///
/// Dropping the handle does not unsubscribe; the observer stays registered
/// until [`Subscription::unsubscribe`] is called or the store goes away.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    observers: Weak<Mutex<Observers>>,
}

impl Subscription {
    /// Remove the observer. Returns `false` if the store no longer exists.
    pub fn unsubscribe(self) -> bool {
        let Some(observers) = self.observers.upgrade() else {
            return false;
        };
        let mut guard = observers.lock().unwrap_or_else(PoisonError::into_inner);
        guard.callbacks.remove(&self.id).is_some()
    }
}

pub struct TokenStore {
    storage: Box<dyn TokenStorage>,
    /// Serializes writers so both keys change together.
    write_lock: Mutex<()>,
    observers: Arc<Mutex<Observers>>,
}

impl TokenStore {
    pub fn new(storage: impl TokenStorage + 'static) -> Self {
        Self {
            storage: Box::new(storage),
            write_lock: Mutex::new(()),
            observers: Arc::new(Mutex::new(Observers::default())),
        }
    }

    /// Persist both tokens. Observers are notified only if the write landed.
    pub fn set_tokens(&self, access: &str, refresh: &str) {
        let applied = {
            let _guard = self.lock_writes();
            match self.write_pair(access, refresh) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Failed to persist tokens: {}", e);
                    false
                }
            }
        };

        if applied {
            self.notify(true);
        }
    }

    fn write_pair(&self, access: &str, refresh: &str) -> Result<(), StorageError> {
        let previous_access = self.storage.get(ACCESS_TOKEN_KEY)?;
        self.storage.set(ACCESS_TOKEN_KEY, access)?;

        if let Err(e) = self.storage.set(REFRESH_TOKEN_KEY, refresh) {
            // Put the old access token back so the pair stays consistent
            let rollback = match previous_access {
                Some(ref old) => self.storage.set(ACCESS_TOKEN_KEY, old),
                None => self.storage.remove(ACCESS_TOKEN_KEY),
            };
            if let Err(rollback_err) = rollback {
                log::warn!("Token rollback failed: {}", rollback_err);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Token read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Remove both tokens and notify observers. Safe to call repeatedly.
    pub fn clear_tokens(&self) {
        {
            let _guard = self.lock_writes();
            for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
                if let Err(e) = self.storage.remove(key) {
                    log::warn!("Failed to remove {}: {}", key, e);
                }
            }
        }
        self.notify(false);
    }

    /// Claims of the stored access token, if it decodes.
    pub fn claims(&self) -> Option<Claims> {
        decode_jwt_payload(&self.access_token()?)
    }

    /// User id claim (`user_id`, `sub`, or `id`) of the stored access token.
    pub fn user_id(&self) -> Option<String> {
        self.claims()?.user_id()
    }

    /// Client-side session check.
    ///
    /// No token means logged out. A token that fails to decode, or carries no
    /// `exp`, is taken at face value.
    pub fn is_authenticated(&self) -> bool {
        let Some(token) = self.access_token() else {
            return false;
        };
        match decode_jwt_payload(&token) {
            Some(claims) => claims.is_live_at(now_seconds()),
            None => true,
        }
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut guard = self.lock_observers();
        let id = guard.next_id;
        guard.next_id += 1;
        guard.callbacks.insert(id, Arc::new(observer));
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    fn notify(&self, logged_in: bool) {
        // Snapshot so observers may subscribe or unsubscribe from inside a callback
        let callbacks: Vec<AuthObserver> = self.lock_observers().callbacks.values().cloned().collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(logged_in))).is_err() {
                log::warn!("Auth observer panicked (logged_in = {})", logged_in);
            }
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_observers(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::jwt::tests::make_token;
    use crate::api::storage::{MemoryStorage, UnavailableStorage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(store: &TokenStore) -> (Arc<Mutex<Vec<bool>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sub = store.subscribe(move |logged_in| sink.lock().unwrap().push(logged_in));
        (events, sub)
    }

    /// Accepts the access token but refuses the refresh token.
    #[derive(Default)]
    struct RefreshRejectingStorage {
        inner: MemoryStorage,
    }

    impl TokenStorage for RefreshRejectingStorage {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == REFRESH_TOKEN_KEY {
                return Err(StorageError::Unavailable);
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_set_get_clear_round_trip() {
        let store = TokenStore::new(MemoryStorage::default());
        store.set_tokens("a", "b");
        assert_eq!(store.access_token().as_deref(), Some("a"));
        assert_eq!(store.refresh_token().as_deref(), Some("b"));

        store.clear_tokens();
        assert_eq!(store.access_token(), None);
        assert_eq!(store.refresh_token(), None);
    }

    #[test]
    fn test_observers_see_transitions() {
        let store = TokenStore::new(MemoryStorage::default());
        let (events, _sub) = recorder(&store);

        store.set_tokens("a", "b");
        store.clear_tokens();
        store.clear_tokens();

        assert_eq!(*events.lock().unwrap(), vec![true, false, false]);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let store = TokenStore::new(MemoryStorage::default());
        let (events, sub) = recorder(&store);

        assert!(sub.unsubscribe());
        store.set_tokens("a", "b");
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_after_store_dropped() {
        let store = TokenStore::new(MemoryStorage::default());
        let (_events, sub) = recorder(&store);
        drop(store);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let store = TokenStore::new(MemoryStorage::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = store.subscribe(|_| panic!("observer failure"));
        let counter = calls.clone();
        let _good = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_tokens("a", "b");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token().as_deref(), Some("a"));
    }

    #[test]
    fn test_unavailable_storage_is_silent() {
        let store = TokenStore::new(UnavailableStorage);
        let (events, _sub) = recorder(&store);

        store.set_tokens("a", "b");
        assert_eq!(store.access_token(), None);
        assert!(!store.is_authenticated());
        assert!(events.lock().unwrap().is_empty());

        store.clear_tokens();
        assert_eq!(*events.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_partial_write_rolls_back() {
        let store = TokenStore::new(RefreshRejectingStorage::default());
        let (events, _sub) = recorder(&store);

        store.set_tokens("a", "b");
        assert_eq!(store.access_token(), None);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_is_authenticated_expiry() {
        let store = TokenStore::new(MemoryStorage::default());
        assert!(!store.is_authenticated());

        let future = now_seconds() as u64 + 3600;
        store.set_tokens(&make_token(&format!(r#"{{"exp":{}}}"#, future)), "r");
        assert!(store.is_authenticated());

        let past = now_seconds() as u64 - 3600;
        store.set_tokens(&make_token(&format!(r#"{{"exp":{}}}"#, past)), "r");
        assert!(!store.is_authenticated());

        store.set_tokens(&make_token(r#"{"sub":"u1"}"#), "r");
        assert!(store.is_authenticated());

        store.set_tokens("opaque-token", "r");
        assert!(store.is_authenticated());
    }

    #[test]
    fn test_user_id_from_access_token() {
        let store = TokenStore::new(MemoryStorage::default());
        assert_eq!(store.user_id(), None);

        store.set_tokens(&make_token(r#"{"user_id":"stu-9"}"#), "r");
        assert_eq!(store.user_id().as_deref(), Some("stu-9"));

        store.set_tokens(&make_token(r#"{"exp":1}"#), "r");
        assert_eq!(store.user_id(), None);
    }
}
