//! Persistence layer: the `Store` trait and its SQLite implementation.

pub mod models;
pub mod sqlite;
pub mod store;

pub use models::{AgentRecord, ApiKey, EnrollmentToken};
pub use sqlite::SqliteStore;
pub use store::{Store, StoreError};
