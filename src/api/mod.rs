//! Authenticated API client for the student portal backend.
//!
//! Provides token storage with auth-state notifications, best-effort JWT
//! claim decoding, an HTTP pipeline with bearer injection and single-flight
//! refresh-and-retry, and the account operations built on top of it.

pub mod account;
pub mod client;
pub mod error;
pub mod jwt;
pub mod refresh;
pub mod storage;
pub mod tokens;
pub mod types;


pub use client::{ApiClient, ApiRequest, ApiResponse};
pub use error::ApiError;
pub use tokens::{Subscription, TokenStore};
