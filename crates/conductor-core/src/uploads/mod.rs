//! Filesystem storage for upload bundles.
//!
//! Files are staged into a temporary directory first and the whole bundle
//! lands at `{upload_root}/{upload_id}` through a single atomic rename,
//! so a reader never observes a half-written bundle.

use std::path::{Path, PathBuf};

use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::StoreError;
use conductor_db::models::{Upload, UploadFile};
use conductor_db::queries::uploads as db;

/// Failure while accepting an upload bundle.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid upload: {0}")]
    Invalid(String),
    #[error("upload storage failed")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One file received from the multipart form.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Store for upload bundles on a local or networked filesystem.
pub struct UploadStore {
    root: PathBuf,
    max_bytes: u64,
}

impl UploadStore {
    pub fn new(root: PathBuf, max_bytes: u64) -> Self {
        Self { root, max_bytes }
    }

    /// Directory holding one bundle's files.
    pub fn bundle_dir(&self, upload_id: Uuid) -> PathBuf {
        self.root.join(upload_id.to_string())
    }

    /// Persist a bundle: validate, stage to a temp directory, record the
    /// metadata rows, then atomically rename the staging directory into
    /// place.
    pub async fn store(
        &self,
        pool: &PgPool,
        files: Vec<IncomingFile>,
    ) -> Result<(Upload, Vec<UploadFile>), UploadError> {
        if files.is_empty() {
            return Err(UploadError::Invalid("bundle contains no files".to_owned()));
        }

        let mut total: u64 = 0;
        let mut seen = std::collections::HashSet::new();
        for file in &files {
            validate_file_name(&file.name)?;
            if !seen.insert(file.name.as_str()) {
                return Err(UploadError::Invalid(format!(
                    "duplicate file name {:?}",
                    file.name
                )));
            }
            total += file.data.len() as u64;
        }
        if total > self.max_bytes {
            return Err(UploadError::Invalid(format!(
                "bundle is {total} bytes, limit is {}",
                self.max_bytes
            )));
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir(&staging).await?;

        let result = self.stage_and_record(pool, &staging, files).await;
        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        result
    }

    async fn stage_and_record(
        &self,
        pool: &PgPool,
        staging: &Path,
        files: Vec<IncomingFile>,
    ) -> Result<(Upload, Vec<UploadFile>), UploadError> {
        let mut descriptors = Vec::with_capacity(files.len());
        for file in &files {
            tokio::fs::write(staging.join(&file.name), &file.data).await?;
            descriptors.push(db::NewUploadFile {
                name: file.name.clone(),
                size: file.data.len() as i64,
                mime_type: file.mime_type.clone(),
            });
        }

        let (upload, rows) = db::insert_upload(pool, &descriptors).await?;

        tokio::fs::rename(staging, self.bundle_dir(upload.id)).await?;
        Ok((upload, rows))
    }
}

fn validate_file_name(name: &str) -> Result<(), UploadError> {
    if name.is_empty() {
        return Err(UploadError::Invalid("empty file name".to_owned()));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(UploadError::Invalid(format!(
            "file name {name:?} must be a plain name without path separators"
        )));
    }
    Ok(())
}
