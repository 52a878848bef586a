//! # Download Manager
//!
//! Front door of the engine. Consumers ask for a download stream by
//! resource descriptor; behind it the manager deduplicates tasks, runs them
//! through admission control, forwards transfer progress, and optionally
//! hands completed data to storage. Dropping a stream releases its
//! reference; the underlying task is canceled once nobody holds one.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::admission::{AdmissionConfig, AdmissionController};
use crate::cache::{CacheProvider, FileStorage};
use crate::error::{DownloadError, Result};
use crate::events::{ResponseInfo, TransferEvent};
use crate::registry::{TaskPriority, TaskRegistry};
use crate::resource::ResourceDescriptor;
use crate::transport::Transport;

/// Configuration for the [`DownloadManager`].
#[derive(Debug, Clone)]
pub struct DownloadManagerConfig {
    /// Save completed remote downloads into temp storage.
    pub save_data: bool,
    /// Maximum number of simultaneously transferring tasks.
    pub simultaneous_tasks: usize,
    /// How often deferred tasks are rechecked for admission.
    pub task_check_interval: Duration,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            save_data: false,
            simultaneous_tasks: 1,
            task_check_interval: Duration::from_secs(5),
        }
    }
}

/// Progress of one consumer's download stream.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    ResponseReceived(ResponseInfo),
    CacheDataAppended(Arc<CacheProvider>),
    /// Terminal. Carries the provider when its data was the transfer's to
    /// hand over (a remote fetch), `None` for local sources.
    Success(Option<Arc<CacheProvider>>),
}

pub struct DownloadManager {
    config: DownloadManagerConfig,
    storage: Arc<FileStorage>,
    registry: Arc<TaskRegistry>,
    admission: Arc<AdmissionController>,
}

impl DownloadManager {
    pub fn new(
        config: DownloadManagerConfig,
        storage: Arc<FileStorage>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(storage.clone(), transport));
        let admission = Arc::new(AdmissionController::new(
            registry.clone(),
            AdmissionConfig {
                simultaneous_tasks: config.simultaneous_tasks,
                check_interval: config.task_check_interval,
            },
        ));
        Self {
            config,
            storage,
            registry,
            admission,
        }
    }

    pub fn storage(&self) -> &Arc<FileStorage> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Start (or join) the download for `descriptor` and stream its
    /// progress.
    ///
    /// Resolution errors surface here; everything after that arrives on the
    /// stream. Dropping the stream drops this consumer's reference to the
    /// task.
    pub fn create_download_stream(
        &self,
        descriptor: &ResourceDescriptor,
        priority: TaskPriority,
    ) -> Result<ReceiverStream<Result<DownloadEvent>>> {
        let task = self.registry.acquire(descriptor, priority)?;
        let mut events = task.events();
        let uid = descriptor.uid.clone();

        let admission = self.admission.clone();
        tokio::spawn({
            let uid = uid.clone();
            async move { admission.admit(&uid).await }
        });

        let (tx, rx) = mpsc::channel(32);
        let registry = self.registry.clone();
        let storage = self.storage.clone();
        let save_data = self.config.save_data;

        tokio::spawn(async move {
            let mut released = false;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => {
                        let Some(event) = event else { break };
                        match event {
                            TransferEvent::ResponseReceived(info) => {
                                if tx.send(Ok(DownloadEvent::ResponseReceived(info))).await.is_err() {
                                    break;
                                }
                            }
                            TransferEvent::DataAppended(provider) => {
                                if tx.send(Ok(DownloadEvent::CacheDataAppended(provider))).await.is_err() {
                                    break;
                                }
                            }
                            TransferEvent::Completed(provider) => {
                                if save_data {
                                    if let Some(provider) = &provider {
                                        if let Err(e) = storage.save_to_temp(provider).await {
                                            warn!(uid = %uid, error = %e, "failed to save completed download");
                                        }
                                    }
                                }
                                registry.release(&uid, true);
                                released = true;
                                let _ = tx.send(Ok(DownloadEvent::Success(provider))).await;
                                break;
                            }
                            TransferEvent::Failed(e) => {
                                registry.release(&uid, true);
                                released = true;
                                let _ = tx
                                    .send(Err(DownloadError::TransferFailed(e.to_string())))
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }
            if !released {
                debug!(uid = %uid, "download stream dropped, releasing task");
                registry.release(&uid, false);
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}
