//! # Transport
//!
//! The boundary between the engine and whatever actually moves bytes.
//! A transport emits a fixed event vocabulary per fetch: response metadata,
//! data chunks, and exactly one terminal `Finished`. The engine ships an
//! HTTP implementation; tests script their own.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::error::{DownloadError, Result};

const DEFAULT_USER_AGENT: &str = concat!("streamio/", env!("CARGO_PKG_VERSION"));

/// Events emitted by a transport for one fetch.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ResponseReceived {
        content_length: Option<u64>,
        content_type: Option<String>,
    },
    Data(Bytes),
    /// Terminal. `error` is set when the fetch died after starting.
    Finished { error: Option<String> },
}

/// Starts fetches and streams their events.
///
/// Errors that occur before any event was emitted (bad url, connect failure,
/// non-success status) are returned from `start` directly; everything later
/// arrives as a `Finished { error }` event. Dropping the receiver cancels
/// the fetch.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self, url: Url, headers: HeaderMap) -> Result<mpsc::Receiver<TransportEvent>>;
}

/// Transport backed by a streaming reqwest client.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(DownloadError::from)?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (custom timeouts, proxy, and so on).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self, url: Url, headers: HeaderMap) -> Result<mpsc::Receiver<TransportEvent>> {
        info!(url = %url, "starting http fetch");
        let response = self.client.get(url.clone()).headers(headers).send().await?;

        if !response.status().is_success() {
            return Err(DownloadError::StatusCode(response.status()));
        }

        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if let Some(len) = content_length {
            debug!(url = %url, content_length = len, "response headers received");
        } else {
            debug!(url = %url, "content length not available");
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if tx
                .send(TransportEvent::ResponseReceived {
                    content_length,
                    content_type,
                })
                .await
                .is_err()
            {
                return;
            }

            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        if tx.send(TransportEvent::Data(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(TransportEvent::Finished {
                                error: Some(e.to_string()),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Finished { error: None }).await;
        });

        Ok(rx)
    }
}
