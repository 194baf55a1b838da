//! At-least-once job handoff between the dispatcher and the worker.
//!
//! Two interchangeable backings: an in-process bounded channel, and an
//! external pub/sub topic behind a transport trait.

pub mod memory;
pub mod pubsub;

use async_trait::async_trait;

use crate::models::job::QueuedJob;

pub use memory::MemoryQueue;
pub use pubsub::{GcpPubSubTransport, PubSubQueue, PubSubTransport};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("payload serialisation error: {0}")]
    Serialise(#[from] serde_json::Error),

    #[error("queue transport error: {0}")]
    Transport(String),
}

/// Error type returned by job handlers; a failing handler triggers
/// redelivery on backings that support it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Producer side of the queue.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError>;
}
