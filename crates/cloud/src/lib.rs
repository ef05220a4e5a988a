//! Object storage for generated outputs.
//!
//! The worker uploads every image a finished prompt produced and records the
//! returned public URLs on the job. [`ObjectStorage`] is the seam; the
//! backends are [`S3Storage`] (AWS S3 or any S3-compatible store) and
//! [`LocalStorage`] (a directory served by something else).

pub mod local;
pub mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use async_trait::async_trait;
use genq_core::types::DbId;

/// Key prefix under which all generation outputs are stored.
pub const GENERATIONS_PREFIX: &str = "generations";

/// Fallback for filenames that reduce to nothing once path parts are removed.
const FALLBACK_FILENAME: &str = "output";

/// Errors from storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend rejected or failed the upload.
    #[error("Upload of '{key}' failed: {message}")]
    Upload { key: String, message: String },

    /// Local filesystem failure.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A place to put generated files.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `key` and return the public URL of the object.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, StorageError>;
}

/// Build the storage key for one output of a job:
/// `generations/<job_id>/<filename>`.
///
/// Only the last path component of `filename` is kept, so names reported by
/// the backend (which may include subfolders) cannot escape the job prefix.
pub fn object_key(job_id: DbId, filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let base = match base {
        "" | "." | ".." => FALLBACK_FILENAME,
        name => name,
    };
    format!("{GENERATIONS_PREFIX}/{job_id}/{base}")
}

/// MIME type for an output file, from its extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Join a public base URL and an object key.
pub(crate) fn public_url(base_url: &str, key: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_keeps_only_the_file_name() {
        assert_eq!(object_key(7, "out_00001_.png"), "generations/7/out_00001_.png");
        assert_eq!(object_key(7, "run/a/out.png"), "generations/7/out.png");
        assert_eq!(object_key(7, "..\\..\\evil.png"), "generations/7/evil.png");
    }

    #[test]
    fn object_key_falls_back_for_empty_names() {
        assert_eq!(object_key(3, ""), "generations/3/output");
        assert_eq!(object_key(3, "sub/"), "generations/3/output");
        assert_eq!(object_key(3, "../.."), "generations/3/output");
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type_for("a.PNG"), "image/png");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("clip.webm"), "video/webm");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn public_url_joins_without_double_slash() {
        assert_eq!(
            public_url("https://cdn.example.com/", "generations/1/a.png"),
            "https://cdn.example.com/generations/1/a.png"
        );
    }
}
