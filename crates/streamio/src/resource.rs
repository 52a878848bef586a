//! # Resource Descriptors
//!
//! A resource is named by an opaque uid and located by a url-ish string that
//! resolves into one of a closed set of concrete sources: a local file or a
//! remote endpoint. Resolution happens once per acquire.

use std::path::PathBuf;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{DownloadError, Result};

/// Identifies and locates a fetchable byte resource.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    /// Opaque identity, stable across restarts. Used as the dedup and
    /// storage key.
    pub uid: String,
    /// Location: an http(s) url, a file url, or a plain filesystem path.
    pub url: String,
    /// Target MIME type supplied by the caller. Takes precedence over
    /// whatever the transfer reports.
    pub content_type: Option<String>,
    /// Extra request headers for remote transfers.
    pub headers: HeaderMap,
}

impl ResourceDescriptor {
    pub fn new(uid: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            url: url.into(),
            content_type: None,
            headers: HeaderMap::new(),
        }
    }

    /// Descriptor whose uid is the url itself.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(url.clone(), url)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a request header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Resolve the descriptor's url into a concrete source.
    pub fn resolve(&self) -> Result<ResolvedSource> {
        if let Ok(url) = Url::parse(&self.url) {
            match url.scheme() {
                "http" | "https" => return Ok(ResolvedSource::Remote(url)),
                "file" => {
                    let path = url
                        .to_file_path()
                        .map_err(|_| DownloadError::InvalidUrl(self.url.clone()))?;
                    return if path.is_file() {
                        Ok(ResolvedSource::LocalFile(path))
                    } else {
                        Err(DownloadError::ResourceMissing {
                            path: path.display().to_string(),
                            uid: self.uid.clone(),
                        })
                    };
                }
                _ => {
                    // A plain path containing a colon parses as an unknown
                    // scheme; only treat it as such when no file matches.
                    let path = PathBuf::from(&self.url);
                    if path.is_file() {
                        return Ok(ResolvedSource::LocalFile(path));
                    }
                    return Err(DownloadError::UnsupportedScheme {
                        url: self.url.clone(),
                        uid: self.uid.clone(),
                    });
                }
            }
        }

        let path = PathBuf::from(&self.url);
        if path.is_file() {
            Ok(ResolvedSource::LocalFile(path))
        } else {
            Err(DownloadError::ResourceMissing {
                path: self.url.clone(),
                uid: self.uid.clone(),
            })
        }
    }
}

/// The concrete source a descriptor resolved into.
#[derive(Debug, Clone)]
pub enum ResolvedSource {
    LocalFile(PathBuf),
    Remote(Url),
}
