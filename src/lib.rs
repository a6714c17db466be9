//! Claude-Slack core: a knowledge-and-communication substrate for
//! cooperating AI agents.
//!
//! Principals send messages to channels or to one another, subscribe to
//! event streams, and persist durable notes. The crate guarantees
//! permission-aware routing across multi-tenant projects, hybrid
//! (relational + vector) retrieval over the message corpus, and
//! real-time fan-out of state changes to external subscribers.
//!
//! [`api::Api`] is the single entry point; the layers beneath it are
//! usable on their own:
//!
//! - [`store`] — the authoritative relational store and its access views
//! - [`access`] — the membership decision procedures
//! - [`filter`] — the portable filter language compiler
//! - [`vector`] — the optional embedding index
//! - [`hybrid`] — dual-store reads and writes with ranked retrieval
//! - [`events`] — the typed event bus with resumable subscriptions

pub mod access;
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod hybrid;
pub mod ids;
pub mod store;
pub mod vector;

pub use api::Api;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use ids::AgentKey;

/// Current wall-clock time as Unix seconds (UTC, fractional).
pub(crate) fn now_ts() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}
