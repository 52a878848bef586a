//! # Media Type Mapping
//!
//! Conversions between MIME types and file extensions, used to infer the
//! content type of local files and to pick an extension for cached files.

/// Look up the MIME type for a file extension.
pub fn mime_from_extension(extension: &str) -> Option<&'static str> {
    let mime = match extension.to_ascii_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "wav" => "audio/wav",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "ts" => "video/mp2t",
        "flv" => "video/x-flv",
        _ => return None,
    };
    Some(mime)
}

/// Look up the preferred file extension for a MIME type.
pub fn extension_from_mime(mime: &str) -> Option<&'static str> {
    let extension = match mime.to_ascii_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/aac" => "aac",
        "audio/mp4" => "m4a",
        "audio/flac" => "flac",
        "audio/ogg" => "ogg",
        "audio/opus" => "opus",
        "audio/wav" | "audio/x-wav" => "wav",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/mp2t" => "ts",
        "video/x-flv" => "flv",
        _ => return None,
    };
    Some(extension)
}
