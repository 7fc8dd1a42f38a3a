//! Traits implemented by queue consumers.

use crate::envelope::Delivery;
use async_trait::async_trait;

/// Provides a stable name for a handler, used in logs and dead-letter info.
///
/// Derive it with `#[derive(HandlerName)]`.
pub trait HandlerName {
    /// Returns the handler's name, e.g. `handler:app-refresh`.
    fn handler_name(&self) -> &str;
}

/// Names the variant of a payload enum.
///
/// Derive it with `#[derive(PayloadType)]`.
pub trait PayloadType {
    /// Returns the variant name.
    fn payload_type(&self) -> &'static str;
}

/// Consumes batches of deliveries from one queue.
///
/// For every delivery in `batch` the handler decides exactly one of ack, retry, or fail by calling
/// the corresponding method on the [`Delivery`]. Decisions may be made from concurrent sub-tasks,
/// but all of them must be joined before `handle` returns. A delivery left undecided is retried.
#[async_trait]
pub trait Handler: HandlerName + Send + Sync {
    /// Processes one batch.
    async fn handle(&self, batch: &[Delivery]);
}
