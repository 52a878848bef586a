//! # Streamio
//!
//! A progressive download and cache engine for media resources.
//! Downloads stream into an in-memory cache buffer that consumers can read
//! while the transfer is still running, with optional two-tier file storage
//! for completed data.
//!
//! ## Features
//!
//! - Deduplicated transfers: concurrent requests for the same resource
//!   share one task
//! - Admission control with a configurable concurrency limit and
//!   priority-aware scheduling
//! - Local-file and remote sources behind one task interface
//! - Byte-range fulfillment over a still-growing buffer
//! - Temp/permanent storage tiers with a persistable index

pub mod admission;
pub mod bridge;
pub mod cache;
pub mod error;
pub mod events;
pub mod manager;
pub mod media_type;
pub mod registry;
pub mod resource;
pub mod task;
pub mod transport;

pub use admission::{AdmissionConfig, AdmissionController};
pub use cache::{
    CacheProvider, CacheState, FileStorage, StateChange, StorageConfig, StorageSize, StorageTier,
};
pub use error::{DownloadError, Result};
pub use events::{ResponseInfo, TransferEvent};

// Re-export the consumer-facing surface
pub use bridge::{BridgeEvent, ContentInfo, RangeBridge, RangeRequest, RangeTicket, RangeUpdate};
pub use manager::{DownloadEvent, DownloadManager, DownloadManagerConfig};
pub use registry::{TaskPriority, TaskRegistry};
pub use resource::{ResolvedSource, ResourceDescriptor};
pub use task::{LocalFileTask, RemoteTask, TransferTask};
pub use transport::{HttpTransport, Transport, TransportEvent};
