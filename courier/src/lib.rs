//! # Courier
//!
//! Asynchronous catalog update pipeline: deduplicated refresh requests, retries through a delay
//! queue, dead-lettering, change ingestion and live fan-out to subscribers.

#![deny(missing_docs)]

pub use courier_core::*;

#[cfg(feature = "derive")]
/// Proc-macros for the `courier` crate.
pub mod derive {
    //! Contains proc-macros for the `courier` crate.
    pub use courier_derive::*;
}

#[cfg(feature = "in-memory")]
/// In-memory broker and collaborators.
pub mod mem {
    //! Contains the in-memory backends for the `courier` crate.
    pub use courier_mem::*;
}

#[cfg(feature = "postgres")]
/// Postgres broker, change store and migrations.
pub mod pg {
    //! Contains the postgres backends for the `courier` crate.
    pub use courier_pg::*;
}

pub mod prelude {
    //! The prelude module for the `courier` crate.
    pub use courier_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
    #[cfg(feature = "postgres")]
    pub use super::pg::{Migrator, PgBroker, PgChangeStore};
}
