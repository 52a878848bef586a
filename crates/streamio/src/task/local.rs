//! # Local File Task
//!
//! Transfer task backed by a file that already exists on disk. The whole
//! file is read in one pass and replayed through the standard event
//! sequence: one response, one data append, then completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::BoxStream;
use tokio::fs;
use tracing::debug;

use crate::cache::CacheProvider;
use crate::events::{EventChannel, ResponseInfo, TransferEvent};
use crate::media_type;
use crate::task::TransferTask;

pub struct LocalFileTask {
    uid: String,
    path: PathBuf,
    provider: Arc<CacheProvider>,
    events: Arc<EventChannel<TransferEvent>>,
    resumed: Arc<AtomicBool>,
    canceled: Arc<AtomicBool>,
}

impl LocalFileTask {
    /// Returns `None` when the file does not exist.
    pub fn new(
        uid: impl Into<String>,
        path: impl Into<PathBuf>,
        target_content_type: Option<String>,
    ) -> Option<Self> {
        let path = path.into();
        if !path.is_file() {
            return None;
        }
        let uid = uid.into();
        Some(Self {
            provider: Arc::new(CacheProvider::new(&uid, target_content_type)),
            uid,
            path,
            events: Arc::new(EventChannel::new(32)),
            resumed: Arc::new(AtomicBool::new(false)),
            canceled: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl TransferTask for LocalFileTask {
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

        let path = self.path.clone();
        let uid = self.uid.clone();
        let provider = self.provider.clone();
        let events = self.events.clone();
        let resumed = self.resumed.clone();
        let canceled = self.canceled.clone();

        tokio::spawn(async move {
            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    // The file vanished between the existence check and the
                    // read. Nothing to show, but not fatal.
                    debug!(uid = %uid, path = ?path, error = %e, "local file unreadable, completing empty");
                    provider.finalize();
                    resumed.store(false, Ordering::SeqCst);
                    events.publish(TransferEvent::Completed(None));
                    return;
                }
            };

            if canceled.load(Ordering::SeqCst) {
                return;
            }

            let mime = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(media_type::mime_from_extension);

            events.publish(TransferEvent::ResponseReceived(ResponseInfo {
                content_length: Some(data.len() as u64),
                content_type: mime.map(str::to_owned),
            }));

            if let Some(mime) = mime {
                provider.set_content_type_if_empty(mime);
            }
            provider.append_data(&data);
            events.publish(TransferEvent::DataAppended(provider.clone()));

            provider.finalize();
            resumed.store(false, Ordering::SeqCst);
            // The local source itself is never handed over for caching.
            events.publish(TransferEvent::Completed(None));
        });
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.resumed.store(false, Ordering::SeqCst);
    }

    fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    fn temp_media_file(extension: &str, content: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join(format!("track.{extension}"))).unwrap();
        file.write_all(content).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_missing_file_yields_no_task() {
        assert!(LocalFileTask::new("uid", "/no/such/file.mp3", None).is_none());
    }

    #[tokio::test]
    async fn test_emits_response_data_and_completion() {
        let dir = temp_media_file("mp3", b"local bytes");
        let task = LocalFileTask::new("uid", dir.path().join("track.mp3"), None).unwrap();
        let mut events = task.events();

        task.resume();

        match events.next().await.unwrap() {
            TransferEvent::ResponseReceived(info) => {
                assert_eq!(info.content_length, Some(11));
                assert_eq!(info.content_type.as_deref(), Some("audio/mpeg"));
            }
            other => panic!("expected response, got {other:?}"),
        }
        match events.next().await.unwrap() {
            TransferEvent::DataAppended(provider) => {
                assert_eq!(provider.current_data().as_ref(), b"local bytes");
                assert_eq!(provider.content_type().as_deref(), Some("audio/mpeg"));
            }
            other => panic!("expected data, got {other:?}"),
        }
        assert!(matches!(
            events.next().await.unwrap(),
            TransferEvent::Completed(None)
        ));
    }

    #[tokio::test]
    async fn test_unreadable_file_completes_empty() {
        let dir = temp_media_file("mp3", b"soon gone");
        let path = dir.path().join("track.mp3");
        let task = LocalFileTask::new("uid", &path, None).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut events = task.events();
        task.resume();

        match events.next().await.unwrap() {
            TransferEvent::Completed(None) => {}
            other => panic!("expected empty completion, got {other:?}"),
        }
        assert_eq!(task.provider().current_length(), 0);
        assert!(task.provider().is_finalized());
    }

    #[tokio::test]
    async fn test_target_content_type_overrides_inferred() {
        let dir = temp_media_file("mp3", b"x");
        let task = LocalFileTask::new(
            "uid",
            dir.path().join("track.mp3"),
            Some("audio/aac".to_string()),
        )
        .unwrap();
        let mut events = task.events();
        task.resume();

        // Drain to completion, then check the provider kept the target type.
        while let Some(event) = events.next().await {
            if event.is_terminal() {
                break;
            }
        }
        assert_eq!(task.provider().content_type().as_deref(), Some("audio/aac"));
    }
}
