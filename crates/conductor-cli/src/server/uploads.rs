//! Upload endpoints: multipart bundle creation, bundle inspection.

use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use uuid::Uuid;

use conductor_core::uploads::IncomingFile;
use conductor_db::models::UploadFile;
use conductor_db::queries::uploads as upload_db;

use super::AppState;
use super::error::ApiError;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub upload_id: Uuid,
    pub files: Vec<UploadFileResponse>,
}

#[derive(Debug, Serialize)]
pub struct UploadFileResponse {
    pub name: String,
    pub size: i64,
    pub mime_type: String,
}

impl From<UploadFile> for UploadFileResponse {
    fn from(f: UploadFile) -> Self {
        Self {
            name: f.name,
            size: f.size,
            mime_type: f.mime_type,
        }
    }
}

/// Accept a `multipart/form-data` bundle; every part with a file name
/// becomes one file of the bundle.
pub async fn create_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        let Some(name) = field.file_name().map(str::to_owned) else {
            // Non-file form fields are ignored.
            continue;
        };
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_owned();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed reading part {name:?}: {e}")))?
            .to_vec();

        files.push(IncomingFile {
            name,
            mime_type,
            data,
        });
    }

    let (upload, rows) = state.uploads.store(&state.pool, files).await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            upload_id: upload.id,
            files: rows.into_iter().map(Into::into).collect(),
        }),
    ))
}

/// Describe an existing bundle.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadResponse>, ApiError> {
    let upload = upload_db::get_upload(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("upload {id} not found")))?;
    let files = upload_db::list_upload_files(&state.pool, upload.id).await?;

    Ok(Json(UploadResponse {
        upload_id: upload.id,
        files: files.into_iter().map(Into::into).collect(),
    }))
}
