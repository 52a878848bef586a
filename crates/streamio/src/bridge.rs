//! # Range Fulfillment
//!
//! Serves byte-range requests out of a cache buffer that is still growing.
//! Each request is fed incrementally as data arrives and is told explicitly
//! when it has been satisfied. The per-request bookkeeping follows a precise
//! accounting scheme: a delivery may run past the end of the requested range
//! when the full requested length fits in the buffer, and satisfaction is
//! judged against the requested length rather than the range end.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::cache::CacheProvider;
use crate::error::DownloadError;
use crate::events::{EventChannel, TransferEvent};

/// A byte range asked for by a consumer: `length` bytes starting at
/// `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub offset: u64,
    pub length: u64,
}

/// Updates delivered to one range request.
#[derive(Debug, Clone)]
pub enum RangeUpdate {
    /// The next slice of bytes for this range, in order.
    Data(Bytes),
    /// The requested length has been delivered. Terminal.
    Satisfied,
    /// The transfer ended before the range could be satisfied. Terminal.
    Finished,
}

/// Resolved metadata of the underlying transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Events published by the bridge itself.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    ContentInfoResolved(ContentInfo),
    TransferFailed(Arc<DownloadError>),
    Finished,
}

/// One outstanding range with its delivery cursor.
struct PendingRange {
    request: RangeRequest,
    /// Absolute buffer offset of the next byte to deliver. Zero means no
    /// delivery has happened yet and the cursor starts at the request
    /// offset.
    current_offset: u64,
    tx: mpsc::UnboundedSender<RangeUpdate>,
}

impl PendingRange {
    fn new(request: RangeRequest, tx: mpsc::UnboundedSender<RangeUpdate>) -> Self {
        Self {
            request,
            current_offset: 0,
            tx,
        }
    }

    /// Deliver whatever `data` newly covers. Returns true when the range is
    /// done with (satisfied or its consumer gone).
    fn respond(&mut self, data: &Bytes) -> bool {
        let buffered = data.len() as u64;
        let resolution_point = if self.current_offset != 0 {
            self.current_offset
        } else {
            self.request.offset
        };
        if buffered <= resolution_point {
            return false;
        }

        let response_length = self.request.length.min(buffered - resolution_point);
        if response_length == 0 {
            return false;
        }

        let slice = data.slice(resolution_point as usize..(resolution_point + response_length) as usize);
        if self.tx.send(RangeUpdate::Data(slice)).is_err() {
            return true;
        }

        let satisfied =
            self.request.length <= resolution_point + response_length - self.request.offset;
        self.current_offset = resolution_point + response_length;

        if satisfied {
            let _ = self.tx.send(RangeUpdate::Satisfied);
        }
        satisfied
    }

    fn finish(&self) {
        let _ = self.tx.send(RangeUpdate::Finished);
    }
}

/// Handle to one submitted range request.
pub struct RangeTicket {
    id: u64,
    pub updates: mpsc::UnboundedReceiver<RangeUpdate>,
}

impl RangeTicket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

enum Command {
    Submit {
        id: u64,
        request: RangeRequest,
        tx: mpsc::UnboundedSender<RangeUpdate>,
    },
    Withdraw {
        id: u64,
    },
}

/// Bridges a transfer's event stream to byte-range consumers.
pub struct RangeBridge {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: Arc<EventChannel<BridgeEvent>>,
    next_id: AtomicU64,
}

impl RangeBridge {
    /// Spawn a bridge over `transfer_events`. `content_type_override`, when
    /// set, replaces whatever content type the transfer reports.
    pub fn spawn(
        transfer_events: BoxStream<'static, TransferEvent>,
        content_type_override: Option<String>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventChannel::new(16));

        tokio::spawn(run(transfer_events, cmd_rx, events.clone(), content_type_override));

        Self {
            cmd_tx,
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Submit a range request. Data already buffered is delivered right
    /// away; the rest follows as the transfer progresses.
    pub fn request(&self, request: RangeRequest) -> RangeTicket {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, updates) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Command::Submit { id, request, tx });
        RangeTicket { id, updates }
    }

    /// Withdraw a request that is no longer wanted. No further updates are
    /// delivered for it.
    pub fn withdraw(&self, ticket: &RangeTicket) {
        let _ = self.cmd_tx.send(Command::Withdraw { id: ticket.id });
    }

    /// Subscribe to bridge events; the latest one is replayed.
    pub fn events(&self) -> BoxStream<'static, BridgeEvent> {
        self.events.subscribe()
    }
}

async fn run(
    mut transfer_events: BoxStream<'static, TransferEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: Arc<EventChannel<BridgeEvent>>,
    content_type_override: Option<String>,
) {
    let mut pending: HashMap<u64, PendingRange> = HashMap::new();
    let mut latest: Option<Arc<CacheProvider>> = None;

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(Command::Submit { id, request, tx }) => {
                        let mut range = PendingRange::new(request, tx);
                        // Catch up on whatever is already buffered.
                        let done = latest
                            .as_ref()
                            .is_some_and(|provider| range.respond(&provider.current_data()));
                        if !done {
                            pending.insert(id, range);
                        }
                        trace!(id = id, offset = request.offset, length = request.length, "range submitted");
                    }
                    Some(Command::Withdraw { id }) => {
                        pending.remove(&id);
                        trace!(id = id, "range withdrawn");
                    }
                    // All handles dropped; nobody can submit or observe.
                    None => break,
                }
            }
            event = transfer_events.next() => {
                match event {
                    Some(TransferEvent::ResponseReceived(info)) => {
                        events.publish(BridgeEvent::ContentInfoResolved(ContentInfo {
                            content_length: info.content_length,
                            content_type: content_type_override
                                .clone()
                                .or(info.content_type),
                        }));
                    }
                    Some(TransferEvent::DataAppended(provider)) => {
                        let data = provider.current_data();
                        latest = Some(provider);
                        pending.retain(|_, range| !range.respond(&data));
                    }
                    Some(TransferEvent::Completed(provider)) => {
                        let provider = provider.or(latest.take());
                        if let Some(provider) = provider {
                            let data = provider.current_data();
                            pending.retain(|_, range| !range.respond(&data));
                        }
                        for range in pending.values() {
                            range.finish();
                        }
                        debug!(unsatisfied = pending.len(), "transfer completed");
                        events.publish(BridgeEvent::Finished);
                        break;
                    }
                    Some(TransferEvent::Failed(error)) => {
                        for range in pending.values() {
                            range.finish();
                        }
                        debug!(error = %error, "transfer failed");
                        events.publish(BridgeEvent::TransferFailed(error));
                        break;
                    }
                    // Event source gone without a terminal event.
                    None => {
                        for range in pending.values() {
                            range.finish();
                        }
                        events.publish(BridgeEvent::Finished);
                        break;
                    }
                }
            }
        }
    }
}
