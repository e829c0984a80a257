//! Runtime configuration from environment variables.
//!
//! `main` loads `.env` first (via `dotenvy`), so values may come from either
//! the process environment or that file. Command-line flags override both.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

use crate::api::client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT};
use crate::api::storage::{FileStorage, KeychainStorage, MemoryStorage};
use crate::api::TokenStore;

/// Used when neither `PORTAL_API_URL` nor `API_URL` is set.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("No user data directory on this platform; set PORTAL_TOKEN_FILE")]
    NoDataDir,
}

/// Where tokens are persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// OS keychain.
    Keychain,
    /// JSON file in the user data directory.
    File,
    /// Process memory only; nothing survives the run.
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub store: StoreKind,
    pub token_file: Option<PathBuf>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// API base URL: PORTAL_API_URL > API_URL > localhost default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let api_base_url = lookup("PORTAL_API_URL")
            .or_else(|| lookup("API_URL"))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let store = match lookup("PORTAL_TOKEN_STORE") {
            Some(value) => StoreKind::from_str(value.trim(), true).map_err(|_| ConfigError::Invalid {
                var: "PORTAL_TOKEN_STORE",
                value,
            })?,
            None => StoreKind::Keychain,
        };

        Ok(Self {
            api_base_url,
            store,
            token_file: lookup("PORTAL_TOKEN_FILE").map(PathBuf::from),
            timeout: seconds(lookup("PORTAL_TIMEOUT_SECS"), "PORTAL_TIMEOUT_SECS", DEFAULT_TIMEOUT)?,
            connect_timeout: seconds(
                lookup("PORTAL_CONNECT_TIMEOUT_SECS"),
                "PORTAL_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT,
            )?,
        })
    }

    /// Build the token store for the configured backend.
    pub fn token_store(&self) -> Result<TokenStore, ConfigError> {
        let store = match self.store {
            StoreKind::Keychain => TokenStore::new(KeychainStorage),
            StoreKind::Memory => TokenStore::new(MemoryStorage::default()),
            StoreKind::File => {
                let path = self
                    .token_file
                    .clone()
                    .or_else(FileStorage::default_path)
                    .ok_or(ConfigError::NoDataDir)?;
                log::debug!("Token file: {}", path.display());
                TokenStore::new(FileStorage::new(path))
            }
        };
        Ok(store)
    }
}

fn seconds(
    value: Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::Invalid { var, value }),
        },
    }
}
