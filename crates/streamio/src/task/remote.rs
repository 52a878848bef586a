//! # Remote Task
//!
//! Transfer task backed by a [`Transport`]. Transport events map one-to-one
//! onto transfer events; every chunk is appended to the cache provider
//! before being announced, so subscribers always observe the buffer in a
//! state that already contains the data they were told about.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::BoxStream;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::cache::CacheProvider;
use crate::error::DownloadError;
use crate::events::{EventChannel, ResponseInfo, TransferEvent};
use crate::task::TransferTask;
use crate::transport::{Transport, TransportEvent};

pub struct RemoteTask {
    uid: String,
    url: Url,
    headers: HeaderMap,
    transport: Arc<dyn Transport>,
    provider: Arc<CacheProvider>,
    events: Arc<EventChannel<TransferEvent>>,
    resumed: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteTask {
    pub fn new(
        uid: impl Into<String>,
        url: Url,
        headers: HeaderMap,
        target_content_type: Option<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let uid = uid.into();
        Self {
            provider: Arc::new(CacheProvider::new(&uid, target_content_type)),
            uid,
            url,
            headers,
            transport,
            events: Arc::new(EventChannel::new(32)),
            resumed: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
        }
    }
}

impl TransferTask for RemoteTask {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn events(&self) -> BoxStream<'static, TransferEvent> {
        self.events.subscribe()
    }

    fn provider(&self) -> Arc<CacheProvider> {
        self.provider.clone()
    }

    fn resume(&self) {
        if self.resumed.swap(true, Ordering::SeqCst) {
            return;
        }

        let transport = self.transport.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();
        let provider = self.provider.clone();
        let events = self.events.clone();
        let resumed = self.resumed.clone();
        let uid = self.uid.clone();

        let handle = tokio::spawn(async move {
            debug!(uid = %uid, url = %url, "remote transfer starting");

            let mut rx = match transport.start(url, headers).await {
                Ok(rx) => rx,
                Err(e) => {
                    resumed.store(false, Ordering::SeqCst);
                    events.publish(TransferEvent::Failed(Arc::new(e)));
                    return;
                }
            };

            let mut finished = false;
            while let Some(event) = rx.recv().await {
                match event {
                    TransportEvent::ResponseReceived {
                        content_length,
                        content_type,
                    } => {
                        if let Some(content_type) = &content_type {
                            provider.set_content_type_if_empty(content_type.clone());
                        }
                        events.publish(TransferEvent::ResponseReceived(ResponseInfo {
                            content_length,
                            content_type,
                        }));
                    }
                    TransportEvent::Data(bytes) => {
                        provider.append_data(&bytes);
                        events.publish(TransferEvent::DataAppended(provider.clone()));
                    }
                    TransportEvent::Finished { error: None } => {
                        provider.finalize();
                        resumed.store(false, Ordering::SeqCst);
                        events.publish(TransferEvent::Completed(Some(provider.clone())));
                        finished = true;
                        break;
                    }
                    TransportEvent::Finished { error: Some(message) } => {
                        resumed.store(false, Ordering::SeqCst);
                        events.publish(TransferEvent::Failed(Arc::new(
                            DownloadError::TransferFailed(message),
                        )));
                        finished = true;
                        break;
                    }
                }
            }

            if !finished {
                resumed.store(false, Ordering::SeqCst);
                events.publish(TransferEvent::Failed(Arc::new(DownloadError::TransferFailed(
                    "transport closed before finishing".to_string(),
                ))));
            }
        });

        *self.driver.lock() = Some(handle);
    }

    fn cancel(&self) {
        self.resumed.store(false, Ordering::SeqCst);
        // Abort rather than signal: a canceled transfer must not deliver a
        // chunk that was already in flight.
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }

    fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }
}
