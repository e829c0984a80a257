//! Student portal client library.
//!
//! [`api`] holds the authenticated HTTP client and account operations;
//! [`config`] reads runtime settings from the environment.

pub mod api;
pub mod config;
