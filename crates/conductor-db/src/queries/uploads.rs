//! Database query functions for the `uploads` and `upload_files` tables.
//!
//! An upload bundle is immutable once created: the row and its file
//! descriptors are inserted together in one transaction and never updated.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{Upload, UploadFile};

/// Descriptor for one file in a new upload bundle.
#[derive(Debug, Clone)]
pub struct NewUploadFile {
    pub name: String,
    pub size: i64,
    pub mime_type: String,
}

/// Create an upload bundle with its file descriptors.
pub async fn insert_upload(
    pool: &PgPool,
    files: &[NewUploadFile],
) -> StoreResult<(Upload, Vec<UploadFile>)> {
    let mut tx = pool.begin().await?;

    let upload = sqlx::query_as::<_, Upload>("INSERT INTO uploads DEFAULT VALUES RETURNING *")
        .fetch_one(&mut *tx)
        .await?;

    let mut rows = Vec::with_capacity(files.len());
    for file in files {
        let row = sqlx::query_as::<_, UploadFile>(
            "INSERT INTO upload_files (upload_id, name, size, mime_type) \
             VALUES ($1, $2, $3, $4) \
             RETURNING *",
        )
        .bind(upload.id)
        .bind(&file.name)
        .bind(file.size)
        .bind(&file.mime_type)
        .fetch_one(&mut *tx)
        .await?;
        rows.push(row);
    }

    tx.commit().await?;
    Ok((upload, rows))
}

/// Fetch an upload bundle by ID.
pub async fn get_upload(pool: &PgPool, id: Uuid) -> StoreResult<Option<Upload>> {
    let upload = sqlx::query_as::<_, Upload>("SELECT * FROM uploads WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(upload)
}

/// List the file descriptors of an upload bundle, by name.
pub async fn list_upload_files(pool: &PgPool, upload_id: Uuid) -> StoreResult<Vec<UploadFile>> {
    let files = sqlx::query_as::<_, UploadFile>(
        "SELECT * FROM upload_files WHERE upload_id = $1 ORDER BY name ASC",
    )
    .bind(upload_id)
    .fetch_all(pool)
    .await?;
    Ok(files)
}
