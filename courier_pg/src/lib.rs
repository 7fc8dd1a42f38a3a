//! # Courier postgres backend
//!
//! Durable queues and change records on Postgres, through `sqlx`.

#![deny(missing_docs)]

/// Queues stored in a table and leased with `FOR UPDATE SKIP LOCKED`
pub mod broker;

/// Change records keyed by upstream transaction id
pub mod change_store;

/// Database migrations for the courier schema
pub mod migrations;

pub use broker::{PgBroker, PgBrokerError};
pub use change_store::PgChangeStore;
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
