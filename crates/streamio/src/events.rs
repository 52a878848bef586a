//! # Transfer Events
//!
//! The event vocabulary emitted by transfer tasks, plus the fan-out channel
//! that carries them. The channel replays the most recent event to late
//! subscribers so a consumer joining mid-transfer immediately sees the
//! current state instead of only future events.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::cache::CacheProvider;
use crate::error::DownloadError;

/// Response metadata reported by a transfer before any data arrives.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Events emitted by a transfer task over its lifetime.
///
/// At most one `ResponseReceived` precedes any `DataAppended`, and exactly
/// one terminal event (`Completed` or `Failed`) closes the sequence.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    ResponseReceived(ResponseInfo),
    /// New data was appended; the provider holds everything buffered so far.
    DataAppended(Arc<CacheProvider>),
    /// The transfer finished. Carries the final cache when the data came from
    /// a remote source; local-file reads complete with `None`.
    Completed(Option<Arc<CacheProvider>>),
    Failed(Arc<DownloadError>),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// Broadcast channel that remembers the last published value.
///
/// Subscribing yields the most recent event first (when one exists) followed
/// by everything published afterwards. Publishing and subscribing serialize
/// on the same lock, so a subscriber either sees an event in its replay slot
/// or receives it live, never neither and never both.
pub struct EventChannel<T> {
    tx: broadcast::Sender<T>,
    last: RwLock<Option<T>>,
}

impl<T: Clone + Send + 'static> EventChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            last: RwLock::new(None),
        }
    }

    /// Publish to current subscribers and remember the value for late ones.
    pub fn publish(&self, event: T) {
        let mut last = self.last.write();
        *last = Some(event.clone());
        // Send while holding the lock so subscribe() cannot interleave.
        let _ = self.tx.send(event);
    }

    /// Subscribe, receiving the most recent event first if one was published.
    pub fn subscribe(&self) -> BoxStream<'static, T> {
        let last = self.last.read();
        let rx = self.tx.subscribe();
        let replay = last.clone();
        drop(last);

        futures::stream::iter(replay)
            .chain(BroadcastStream::new(rx).filter_map(|item| futures::future::ready(item.ok())))
            .boxed()
    }

    pub fn last(&self) -> Option<T> {
        self.last.read().clone()
    }
}
