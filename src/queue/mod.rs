//! Single-consumer pipeline for index mutations
//!
//! ```text
//! producer threads ──enqueue──→ OperationQueue (FIFO) ──dequeue(poll)──→ OperationProcessor
//!                                                                          (one thread)
//!                                                                              │ execute()
//!                                                                              ▼
//!                                                                         IndexStorage
//! ```
//!
//! Operations run strictly in enqueue order, one at a time. A failing or
//! panicking operation is logged and never stops the processor.

pub mod operations;
pub mod processor;
#[allow(clippy::module_inception)]
pub mod queue;

pub use operations::{IndexResourceOperation, ReadLocationOperation, RemoveResourceOperation};
pub use processor::{OperationProcessor, ProcessorState};
pub use queue::OperationQueue;

use crate::error::Result;

/// A unit of work executed by the processor thread
pub trait PendingOperation: Send {
    /// Short name used in logs
    fn kind(&self) -> &'static str;

    fn execute(self: Box<Self>) -> Result<()>;

    /// Whether this operation is obsolete once `resource` is removed
    fn should_drop_on_resource_removal(&self, _resource: &str) -> bool {
        false
    }

    /// Resource this operation removes, if any
    fn removed_resource(&self) -> Option<&str> {
        None
    }
}
