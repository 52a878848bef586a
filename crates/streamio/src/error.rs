use reqwest::StatusCode;

/// Errors produced while resolving and transferring stream resources.
///
/// `UnsupportedScheme` and `ResourceMissing` surface synchronously to the
/// caller that triggered task creation and never enter the registry.
/// `TransferFailed` fans out to every consumer of the shared transfer.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("unsupported url scheme for resource {uid}: {url}")]
    UnsupportedScheme { url: String, uid: String },

    #[error("local file for resource {uid} does not exist: {path}")]
    ResourceMissing { path: String, uid: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("server returned status code {0}")]
    StatusCode(StatusCode),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

pub type Result<T> = std::result::Result<T, DownloadError>;
