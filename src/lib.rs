//! Two-stage handoff verification for a flight-courier marketplace.
//!
//! This crate implements the custody chain of a sender-to-courier-to-recipient
//! shipment: a courier accepts a sender's request, the sender proves the first
//! handoff with a 4-digit pickup code, and the recipient proves the final
//! handoff with an independent 4-digit delivery code. Each stage tracks a
//! bounded attempt counter, incremented atomically so concurrent guesses are
//! never lost.
//!
//! State transitions are typestate methods on `Request<State>` with a single
//! dispatch table in [`request::transition`]; storage is pluggable
//! (PostgreSQL or in-memory) behind the [`Storage`] trait.

pub mod codes;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod request;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use codes::{CodeGenerator, DEFAULT_MAX_DRAWS};
pub use error::{HandoffError, Result};
pub use notify::{MockNotifier, Notification, NotificationKind, Notifier, WebhookNotifier};
pub use request::*;
pub use service::{CodeEnvelope, HandoffConfig, HandoffService};
#[cfg(feature = "postgres")]
pub use storage::PostgresStorage;
pub use storage::{MemoryStorage, Storage};

/// Get the handoff database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
