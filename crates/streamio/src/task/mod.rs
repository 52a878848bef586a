//! # Transfer Tasks
//!
//! A transfer task produces the bytes of one resource and narrates its
//! progress as [`TransferEvent`]s. Local-file and remote variants are
//! interchangeable from the consumer's point of view: both feed the same
//! cache provider and speak the same event vocabulary.

pub mod local;
pub mod remote;

use std::sync::Arc;

use futures::stream::BoxStream;

use crate::cache::CacheProvider;
use crate::events::TransferEvent;

pub use local::LocalFileTask;
pub use remote::RemoteTask;

/// One unit of transfer work for a single resource.
pub trait TransferTask: Send + Sync {
    fn uid(&self) -> &str;

    /// Subscribe to the task's progress. The stream replays the most recent
    /// event, so a subscriber joining mid-transfer sees current state.
    fn events(&self) -> BoxStream<'static, TransferEvent>;

    /// The cache buffer this task writes into.
    fn provider(&self) -> Arc<CacheProvider>;

    /// Start (or restart) producing. Idempotent while already running.
    fn resume(&self);

    /// Stop producing. No events are delivered after this returns, not even
    /// a partially transferred chunk.
    fn cancel(&self);

    /// Whether the task is actively transferring right now.
    fn is_resumed(&self) -> bool;
}
