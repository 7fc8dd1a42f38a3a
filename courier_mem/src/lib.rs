//! # Courier memory backends
//!
//! In-memory implementations of the broker and of every collaborator, primarily for testing and
//! single-process development.
//!
//! Each fake collaborator exposes [`Faults`] to make its next calls fail with a chosen
//! [`ErrorKind`](courier_core::error::ErrorKind):
//!
//! ```ignore
//! let upstream = ScriptedUpstream::new();
//! upstream.faults().push(CollaboratorError::rate_limited("429"));
//! ```

#![deny(missing_docs)]

mod broker;
mod cache;
mod connection;
mod faults;
mod stores;

pub use broker::*;
pub use cache::*;
pub use connection::*;
pub use faults::*;
pub use stores::*;
