//! 分片上传的 HTTP 处理器：解析表单、暂存分片、返回合并结果。

use axum::extract::multipart::Field;
use axum::extract::{Extension, Json, Multipart};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk_store::UploadKey;
use crate::coordinator::{ChunkOutcome, ChunkRequest, UploadCoordinator};
use crate::error::ApiError;

#[derive(Debug)]
pub struct UploadConfig {
    pub staging_dir: PathBuf,
    /// 0 disables the limit.
    pub max_chunk_size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadInitRequest {
    filename: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadInitResponse {
    upload_id: String,
    filename: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadAbortRequest {
    upload_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChunkResponse {
    status: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_chunk: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    received: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

/// Multipart fields of one chunk request.
#[derive(Default)]
struct ChunkForm {
    upload_id: Option<String>,
    filename: Option<String>,
    chunk_index: Option<String>,
    chunks: Option<String>,
    file: Option<StagedChunk>,
}

/// 暂存在磁盘上的分片内容。
struct StagedChunk {
    path: PathBuf,
    bytes: u64,
}

impl StagedChunk {
    async fn remove(self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            warn!(path = ?self.path, error = %err, "failed to remove staged chunk");
        }
    }
}

/// 为新上传分配唯一的上传 ID。
pub async fn init_upload(
    Json(payload): Json<UploadInitRequest>,
) -> Result<JsonResponse<UploadInitResponse>, ApiError> {
    let filename = payload.filename.trim().to_string();
    if filename.is_empty() {
        return Err(ApiError::BadRequest("filename is required".into()));
    }
    let upload_id = Uuid::new_v4().to_string();
    info!(upload_id, filename, "init upload");
    Ok(JsonResponse(UploadInitResponse {
        upload_id,
        filename,
    }))
}

/// 上传单个分片，最后一个到达的分片会触发合并。
pub async fn upload_chunk(
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut form = read_chunk_form(multipart, &upload).await?;
    let Some(staged) = form.file.take() else {
        return Err(ApiError::BadRequest("no file uploaded".into()));
    };
    let result = submit_chunk(&coordinator, form, &staged).await;
    staged.remove().await;
    result
}

async fn submit_chunk(
    coordinator: &UploadCoordinator,
    form: ChunkForm,
    staged: &StagedChunk,
) -> Result<Response, ApiError> {
    let (Some(filename), Some(chunk_index), Some(chunks)) =
        (form.filename, form.chunk_index, form.chunks)
    else {
        return Err(ApiError::BadRequest(
            "chunkIndex, chunks and filename are required".into(),
        ));
    };
    let index = parse_count(&chunk_index, "chunkIndex")?;
    let total_chunks = parse_count(&chunks, "chunks")?;
    let key = match form.upload_id.as_deref().map(str::trim) {
        Some(upload_id) if !upload_id.is_empty() => UploadKey::parse(upload_id)?,
        _ => {
            debug!(filename, "no uploadId given, deriving key from filename");
            UploadKey::from_filename(&filename)?
        }
    };

    let payload = File::open(&staged.path)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    debug!(
        upload_key = %key,
        chunk_index = index,
        bytes = staged.bytes,
        "chunk received"
    );
    let outcome = coordinator
        .accept_chunk(ChunkRequest {
            key,
            filename,
            index,
            total_chunks,
            payload,
        })
        .await?;

    let response = match outcome {
        ChunkOutcome::Accepted {
            index,
            total_chunks,
            received,
        } => (
            StatusCode::OK,
            JsonResponse(ChunkResponse {
                status: "accepted",
                message: "chunk uploaded",
                current_chunk: Some(index),
                total_chunks: Some(total_chunks),
                received: Some(received),
                filename: None,
                size: None,
            }),
        ),
        ChunkOutcome::Merging {
            index,
            total_chunks,
        } => (
            StatusCode::ACCEPTED,
            JsonResponse(ChunkResponse {
                status: "merging",
                message: "chunk uploaded, upload is being merged",
                current_chunk: Some(index),
                total_chunks: Some(total_chunks),
                received: None,
                filename: None,
                size: None,
            }),
        ),
        ChunkOutcome::Complete {
            artifact,
            path,
            bytes,
        } => {
            debug!(path = ?path, bytes, "artifact written");
            (
                StatusCode::CREATED,
                JsonResponse(ChunkResponse {
                    status: "complete",
                    message: "upload merged",
                    current_chunk: None,
                    total_chunks: None,
                    received: None,
                    filename: Some(artifact),
                    size: Some(bytes),
                }),
            )
        }
    };
    Ok(response.into_response())
}

fn parse_count(value: &str, field: &str) -> Result<u32, ApiError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ApiError::BadRequest(format!("{field} must be a non-negative integer")))
}

async fn read_chunk_form(
    mut multipart: Multipart,
    upload: &UploadConfig,
) -> Result<ChunkForm, ApiError> {
    let mut form = ChunkForm::default();
    let parsed: Result<(), ApiError> = async {
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::BadRequest(err.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    if form.file.is_some() {
                        return Err(ApiError::BadRequest("only one file per chunk".into()));
                    }
                    form.file = Some(stage_field(&mut field, upload).await?);
                }
                "uploadId" => form.upload_id = Some(field_text(field).await?),
                "filename" => form.filename = Some(field_text(field).await?),
                "chunkIndex" => form.chunk_index = Some(field_text(field).await?),
                "chunks" => form.chunks = Some(field_text(field).await?),
                _ => debug!(field = name, "ignoring unknown form field"),
            }
        }
        Ok(())
    }
    .await;

    match parsed {
        Ok(()) => Ok(form),
        Err(err) => {
            if let Some(staged) = form.file.take() {
                staged.remove().await;
            }
            Err(err)
        }
    }
}

async fn field_text(field: Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))
}

/// 将文件字段写入暂存目录，超过分片大小上限时删除并报错。
async fn stage_field(field: &mut Field<'_>, upload: &UploadConfig) -> Result<StagedChunk, ApiError> {
    fs::create_dir_all(&upload.staging_dir)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let path = upload.staging_dir.join(format!(
        "{}-{}.part",
        Utc::now().timestamp_millis(),
        Uuid::new_v4()
    ));
    let mut file = File::create(&path)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let written: Result<u64, ApiError> = async {
        let mut total_written: u64 = 0;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| ApiError::BadRequest(err.to_string()))?
        {
            if chunk.is_empty() {
                continue;
            }
            total_written += chunk.len() as u64;
            if upload.max_chunk_size > 0 && total_written > upload.max_chunk_size {
                return Err(ApiError::BadRequest("chunk too large".into()));
            }
            file.write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        Ok(total_written)
    }
    .await;
    drop(file);

    match written {
        Ok(bytes) => Ok(StagedChunk { path, bytes }),
        Err(err) => {
            let _ = fs::remove_file(&path).await;
            Err(err)
        }
    }
}

/// 中止上传并清理已保存的分片。
pub async fn abort_upload(
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    Json(payload): Json<UploadAbortRequest>,
) -> Result<StatusCode, ApiError> {
    let key = UploadKey::parse(&payload.upload_id)?;
    coordinator.abort(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 清理请求异常中断后遗留的暂存文件。
pub async fn cleanup_staging(dir: &Path, ttl: Duration) -> Result<(), std::io::Error> {
    if ttl.is_zero() || fs::metadata(dir).await.is_err() {
        return Ok(());
    }

    let now = SystemTime::now();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = match metadata.modified() {
            Ok(value) => value,
            Err(_) => continue,
        };
        let age = match now.duration_since(modified) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if age >= ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale staged chunk");
            } else {
                info!(path = ?path, "removed stale staged chunk");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body as AxumBody, to_bytes};
    use axum::extract::FromRequest;
    use axum::http::{Request, header};
    use serde_json::Value;
    use tempfile::tempdir;

    use crate::chunk_store::ChunkStore;
    use crate::coordinator::CoordinatorConfig;
    use crate::storage::Storage;

    const BOUNDARY: &str = "stitchd-test-boundary";

    struct Fixture {
        temp: tempfile::TempDir,
        coordinator: Arc<UploadCoordinator>,
        upload: Arc<UploadConfig>,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let coordinator = Arc::new(UploadCoordinator::new(
            ChunkStore::new(temp.path().join("chunks"), 64),
            Storage::new(temp.path().join("artifacts")),
            CoordinatorConfig {
                max_chunks: 16,
                lock_wait: Duration::from_secs(5),
                chunk_ttl: Duration::from_secs(3600),
            },
        ));
        let upload = Arc::new(UploadConfig {
            staging_dir: temp.path().join("staging"),
            max_chunk_size: 64,
        });
        Fixture {
            temp,
            coordinator,
            upload,
        }
    }

    async fn multipart(fields: &[(&str, &[u8])]) -> Multipart {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            if *name == "file" {
                body.extend_from_slice(
                    b"Content-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\
                      Content-Type: application/octet-stream\r\n\r\n",
                );
            } else {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
            }
            body.extend_from_slice(value);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("request");
        Multipart::from_request(request, &())
            .await
            .expect("multipart")
    }

    async fn send(fx: &Fixture, fields: &[(&str, &[u8])]) -> Result<Response, ApiError> {
        upload_chunk(
            Extension(fx.coordinator.clone()),
            Extension(fx.upload.clone()),
            multipart(fields).await,
        )
        .await
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn staging_is_empty(fx: &Fixture) -> bool {
        match std::fs::read_dir(&fx.upload.staging_dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn upload_flow_merges_out_of_order_chunks() {
        let fx = fixture();
        let order: [(&[u8], &[u8]); 3] = [(b"2", b"CCC"), (b"0", b"AAA"), (b"1", b"BBB")];
        let mut responses = Vec::new();
        for (index, content) in order {
            let response = send(
                &fx,
                &[
                    ("file", content),
                    ("chunkIndex", index),
                    ("chunks", b"3"),
                    ("filename", b"report.pdf"),
                    ("uploadId", b"session-1"),
                ],
            )
            .await
            .unwrap_or_else(|err| panic!("chunk failed: {err:?}"));
            responses.push(response);
        }

        let last = responses.pop().expect("last");
        assert_eq!(last.status(), StatusCode::CREATED);
        let body = json_body(last).await;
        assert_eq!(body["status"], "complete");
        assert_eq!(body["filename"], "report.pdf");
        assert_eq!(body["size"], 9);

        let first = responses.remove(0);
        assert_eq!(first.status(), StatusCode::OK);
        let body = json_body(first).await;
        assert_eq!(body["currentChunk"], 2);
        assert_eq!(body["totalChunks"], 3);

        let artifact = fx.temp.path().join("artifacts/report.pdf");
        assert_eq!(std::fs::read(artifact).expect("artifact"), b"AAABBBCCC");
        assert!(staging_is_empty(&fx));
    }

    #[tokio::test]
    async fn legacy_client_without_upload_id_uses_filename() {
        let fx = fixture();
        let response = send(
            &fx,
            &[
                ("chunkIndex", b"0"),
                ("chunks", b"2"),
                ("filename", b"movie.mp4"),
                ("file", b"abc"),
            ],
        )
        .await
        .unwrap_or_else(|err| panic!("chunk failed: {err:?}"));

        assert_eq!(response.status(), StatusCode::OK);
        assert!(fx.temp.path().join("chunks/movie.mp4/chunk-0").exists());
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_and_staging_cleaned() {
        let fx = fixture();
        let no_index = send(&fx, &[("file", b"abc"), ("chunks", b"2"), ("filename", b"f")]).await;
        assert!(matches!(no_index, Err(ApiError::BadRequest(_))));

        let no_file = send(&fx, &[("chunkIndex", b"0"), ("chunks", b"2"), ("filename", b"f")]).await;
        assert!(matches!(no_file, Err(ApiError::BadRequest(_))));

        let bad_number = send(
            &fx,
            &[
                ("file", b"abc"),
                ("chunkIndex", b"-1"),
                ("chunks", b"2"),
                ("filename", b"f"),
            ],
        )
        .await;
        assert!(matches!(bad_number, Err(ApiError::BadRequest(_))));
        assert!(staging_is_empty(&fx));
    }

    #[tokio::test]
    async fn oversized_file_part_is_rejected() {
        let fx = fixture();
        let big = vec![b'x'; 65];
        let result = send(
            &fx,
            &[
                ("chunkIndex", b"0"),
                ("chunks", b"1"),
                ("filename", b"f"),
                ("file", &big),
            ],
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(staging_is_empty(&fx));
        assert!(!fx.temp.path().join("artifacts/f").exists());
    }

    #[tokio::test]
    async fn total_mismatch_returns_bad_request() {
        let fx = fixture();
        let fields = |chunks: &'static [u8]| -> Vec<(&'static str, &'static [u8])> {
            vec![
                ("uploadId", &b"u1"[..]),
                ("chunkIndex", &b"1"[..]),
                ("chunks", chunks),
                ("filename", &b"f.bin"[..]),
                ("file", &b"data"[..]),
            ]
        };
        send(&fx, &fields(b"3"))
            .await
            .unwrap_or_else(|err| panic!("first chunk failed: {err:?}"));

        let result = send(&fx, &fields(b"4")).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn init_issues_unique_ids_and_abort_purges() {
        let fx = fixture();
        let JsonResponse(first) = init_upload(Json(UploadInitRequest {
            filename: "a.bin".into(),
        }))
        .await
        .unwrap_or_else(|err| panic!("init failed: {err:?}"));
        let JsonResponse(second) = init_upload(Json(UploadInitRequest {
            filename: "a.bin".into(),
        }))
        .await
        .unwrap_or_else(|err| panic!("init failed: {err:?}"));
        assert_ne!(first.upload_id, second.upload_id);

        let empty = init_upload(Json(UploadInitRequest {
            filename: "  ".into(),
        }))
        .await;
        assert!(matches!(empty, Err(ApiError::BadRequest(_))));

        let upload_id = first.upload_id.clone();
        send(
            &fx,
            &[
                ("uploadId", upload_id.as_bytes()),
                ("chunkIndex", b"0"),
                ("chunks", b"2"),
                ("filename", b"a.bin"),
                ("file", b"data"),
            ],
        )
        .await
        .unwrap_or_else(|err| panic!("chunk failed: {err:?}"));

        let status = abort_upload(
            Extension(fx.coordinator.clone()),
            Json(UploadAbortRequest {
                upload_id: upload_id.clone(),
            }),
        )
        .await
        .unwrap_or_else(|err| panic!("abort failed: {err:?}"));
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!fx.temp.path().join("chunks").join(&upload_id).exists());

        let again = abort_upload(
            Extension(fx.coordinator.clone()),
            Json(UploadAbortRequest { upload_id }),
        )
        .await;
        assert!(matches!(again, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn cleanup_staging_removes_old_files_only() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("staging");
        std::fs::create_dir_all(&dir).expect("dir");
        std::fs::write(dir.join("old.part"), b"x").expect("write");

        cleanup_staging(&dir, Duration::from_secs(3600))
            .await
            .expect("cleanup");
        assert!(dir.join("old.part").exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cleanup_staging(&dir, Duration::from_millis(1))
            .await
            .expect("cleanup");
        assert!(!dir.join("old.part").exists());
    }
}
