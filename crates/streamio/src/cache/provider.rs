//! # Cache Provider
//!
//! An append-only byte buffer for a single resource. One transfer task
//! writes into it while any number of readers take snapshots of the data
//! buffered so far.

use std::fmt;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::warn;

struct ProviderState {
    buffer: BytesMut,
    content_type: Option<String>,
    finalized: bool,
}

/// Growing byte cache for one resource.
///
/// The buffer only ever grows, the content type is write-once, and after
/// finalization no further appends are accepted. Reads return an owned
/// snapshot so a concurrent writer can never tear them.
pub struct CacheProvider {
    uid: String,
    state: RwLock<ProviderState>,
}

impl CacheProvider {
    /// Create an empty provider. `target_content_type`, when given, pins the
    /// content type up front so values reported later by the transfer do not
    /// override it.
    pub fn new(uid: impl Into<String>, target_content_type: Option<String>) -> Self {
        Self {
            uid: uid.into(),
            state: RwLock::new(ProviderState {
                buffer: BytesMut::new(),
                content_type: target_content_type,
                finalized: false,
            }),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Append a chunk to the buffer. Appends after finalization are dropped.
    pub fn append_data(&self, chunk: &[u8]) {
        let mut state = self.state.write();
        if state.finalized {
            warn!(uid = %self.uid, len = chunk.len(), "append after finalization dropped");
            return;
        }
        state.buffer.extend_from_slice(chunk);
    }

    /// Set the content type unless one is already known.
    pub fn set_content_type_if_empty(&self, content_type: impl Into<String>) {
        let mut state = self.state.write();
        if state.content_type.is_none() {
            state.content_type = Some(content_type.into());
        }
    }

    pub fn content_type(&self) -> Option<String> {
        self.state.read().content_type.clone()
    }

    /// Snapshot of everything buffered so far.
    pub fn current_data(&self) -> Bytes {
        let state = self.state.read();
        Bytes::copy_from_slice(&state.buffer)
    }

    pub fn current_length(&self) -> u64 {
        self.state.read().buffer.len() as u64
    }

    /// Mark the buffer complete. Idempotent.
    pub fn finalize(&self) {
        self.state.write().finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.state.read().finalized
    }
}

impl fmt::Debug for CacheProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("CacheProvider")
            .field("uid", &self.uid)
            .field("len", &state.buffer.len())
            .field("content_type", &state.content_type)
            .field("finalized", &state.finalized)
            .finish()
    }
}
