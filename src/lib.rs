//! Watches a followed-channel feed and a public channel list, keeps a snapshot
//! of who is live, and serves it over HTTP.
//!
//! Data flows leaves-first:
//!
//! ```text
//! auth (TokenManager) -> follows -> streams -> poller -> service -> client
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod follows;
pub mod http;
pub mod poller;
pub mod service;
pub mod streams;
