//! Database-backed publish/subscribe messaging over SQLite, PostgreSQL, or
//! TimescaleDB.
//!
//! [`Store`] is the core: it owns the connection pool and the message and
//! access tables. [`Publisher`] and [`Subscriber`] wrap it with the
//! in-process queueing that decouples callers from per-message database
//! round-trips.

pub mod access;
#[cfg(feature = "database")]
pub mod config;
#[cfg(feature = "database")]
pub mod db;
mod error;
#[cfg(feature = "database")]
mod keys;
#[cfg(feature = "database")]
pub mod message;
#[cfg(feature = "database")]
pub mod publisher;
#[cfg(feature = "database")]
pub mod store;
#[cfg(feature = "database")]
pub mod subscriber;

pub use error::Error;
#[cfg(feature = "database")]
pub use publisher::{Publisher, PublisherConfig};
#[cfg(feature = "database")]
pub use store::Store;
#[cfg(feature = "database")]
pub use subscriber::{Subscriber, SubscriberConfig};

pub type Result<T, E = Error> = std::result::Result<T, E>;
