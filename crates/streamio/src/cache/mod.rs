//! # Cache
//!
//! The growing per-resource byte buffer and the two-tier file storage that
//! completed downloads are saved into.

pub mod provider;
pub mod storage;

pub use provider::CacheProvider;
pub use storage::{
    CacheState, FileStorage, StateChange, StorageConfig, StorageSize, StorageTier,
};
