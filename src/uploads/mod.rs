//! Media staging for the wizard.
//!
//! A batch is uploaded concurrently and merged once every upload has settled.
//! Successful uploads are appended in selection order, never completion order,
//! and a failed file never becomes a [`Photo`].

pub mod imgbb;

use crate::errors::{EngineError, FileFailure};
use crate::models::Photo;
use crate::wizard::draft::DraftStore;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub use imgbb::{ImgbbConfig, ImgbbUploader};

/// A file selected by the user, already read into memory.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("image host is not configured")]
    NotConfigured,
    #[error("file is empty")]
    EmptyFile,
    #[error("http error: {0}")]
    Http(String),
    #[error("rejected by image host: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Opaque "upload photo → URL" collaborator.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, file: &LocalFile) -> Result<Photo, UploadError>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchReport {
    pub added: Vec<Photo>,
    pub failures: Vec<FileFailure>,
}

/// Fans out one upload per file and waits for all of them. Results are
/// returned in the same order as `files`.
pub async fn upload_all(
    uploader: &dyn MediaUploader,
    files: &[LocalFile],
) -> Vec<Result<Photo, UploadError>> {
    join_all(files.iter().map(|file| uploader.upload(file))).await
}

/// Merges settled results into the draft. A batch where every file failed
/// leaves `photos` untouched and reports an upload error.
pub fn merge_batch(
    store: &mut DraftStore,
    files: &[LocalFile],
    results: Vec<Result<Photo, UploadError>>,
) -> Result<BatchReport, EngineError> {
    let attempted = results.len();
    let mut added = Vec::new();
    let mut failures = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(photo) => added.push(photo),
            Err(err) => {
                let name = files
                    .get(index)
                    .map(|file| file.name.clone())
                    .unwrap_or_default();
                warn!(target: "rehoming.uploads", index, file = %name, error = %err, "upload_failed");
                failures.push(FileFailure {
                    index,
                    name,
                    error: err.to_string(),
                });
            }
        }
    }
    crate::metrics::upload_batch(attempted, added.len());

    if attempted > 0 && added.is_empty() {
        return Err(EngineError::Upload {
            attempted,
            failures,
        });
    }
    if !added.is_empty() {
        store.draft_mut().photos.extend(added.iter().cloned());
        store.mark_edited("photos");
    }
    info!(
        target: "rehoming.uploads",
        attempted,
        succeeded = added.len(),
        "upload_batch_merged"
    );
    Ok(BatchReport { added, failures })
}

/// Uploads a batch and merges it into `store` in one call.
pub async fn stage_batch(
    store: &mut DraftStore,
    uploader: &dyn MediaUploader,
    files: &[LocalFile],
) -> Result<BatchReport, EngineError> {
    let results = upload_all(uploader, files).await;
    merge_batch(store, files, results)
}

/// Removes a staged photo by URL. The next photo, if any, becomes primary.
pub fn remove_photo(store: &mut DraftStore, url: &str) -> bool {
    let photos = &mut store.draft_mut().photos;
    let before = photos.len();
    photos.retain(|photo| photo.url != url);
    let removed = photos.len() != before;
    if removed {
        store.mark_edited("photos");
    }
    removed
}
