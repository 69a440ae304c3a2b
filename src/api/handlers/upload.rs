use crate::AppState;
use crate::api::error::AppError;
use crate::models::{
    ApiErrorBody, CHUNK_CHECKSUM_HEADER, ChunkAck, CompleteUploadRequest, CompleteUploadResponse,
    InitUploadRequest, InitUploadResponse, SessionStatusResponse,
};
use crate::utils::auth::Claims;
use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};

#[utoipa::path(
    post,
    path = "/uploads",
    request_body = InitUploadRequest,
    responses(
        (status = 201, description = "Upload session created", body = InitUploadResponse),
        (status = 400, description = "Invalid destination or request", body = ApiErrorBody),
        (status = 403, description = "Destination belongs to another user", body = ApiErrorBody),
        (status = 429, description = "Too many pending sessions", body = ApiErrorBody)
    ),
    security(
        ("jwt" = [])
    ),
    tag = "uploads"
)]
pub async fn init_upload_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<InitUploadRequest>,
) -> Result<(StatusCode, Json<InitUploadResponse>), AppError> {
    let res = state.uploads.init_session(&claims.sub, req).await?;
    Ok((StatusCode::CREATED, Json(res)))
}

#[utoipa::path(
    get,
    path = "/uploads",
    responses(
        (status = 200, description = "Pending upload sessions", body = Vec<SessionStatusResponse>),
        (status = 401, description = "Unauthorized", body = ApiErrorBody)
    ),
    security(
        ("jwt" = [])
    ),
    tag = "uploads"
)]
pub async fn list_pending_sessions_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<SessionStatusResponse>>, AppError> {
    let sessions = state.uploads.list_pending_sessions(&claims.sub).await?;
    Ok(Json(sessions))
}

#[utoipa::path(
    get,
    path = "/uploads/{session_id}",
    params(
        ("session_id" = String, Path, description = "Upload Session ID")
    ),
    responses(
        (status = 200, description = "Received and missing chunks", body = SessionStatusResponse),
        (status = 404, description = "Session not found", body = ApiErrorBody),
        (status = 410, description = "Session expired", body = ApiErrorBody)
    ),
    security(
        ("jwt" = [])
    ),
    tag = "uploads"
)]
pub async fn session_status_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, AppError> {
    let status = state
        .uploads
        .session_status(&claims.sub, &session_id)
        .await?;
    Ok(Json(status))
}

#[utoipa::path(
    put,
    path = "/uploads/{session_id}/chunks/{chunk_index}",
    request_body(content = Vec<u8>, description = "Chunk data", content_type = "application/octet-stream"),
    params(
        ("session_id" = String, Path, description = "Upload Session ID"),
        ("chunk_index" = u32, Path, description = "Chunk index (0-based)"),
        ("x-chunk-checksum" = Option<String>, Header, description = "xxh3-64 hex digest of the body")
    ),
    responses(
        (status = 200, description = "Chunk stored", body = ChunkAck),
        (status = 400, description = "Invalid chunk index or checksum", body = ApiErrorBody),
        (status = 404, description = "Session not found", body = ApiErrorBody),
        (status = 410, description = "Session expired", body = ApiErrorBody),
        (status = 413, description = "Chunk too large", body = ApiErrorBody)
    ),
    security(
        ("jwt" = [])
    ),
    tag = "uploads"
)]
pub async fn upload_chunk_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((session_id, chunk_index)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkAck>, AppError> {
    let checksum = match headers.get(CHUNK_CHECKSUM_HEADER) {
        Some(v) => Some(
            v.to_str()
                .map_err(|_| AppError::BadRequest("Malformed chunk checksum header".to_string()))?,
        ),
        None => None,
    };

    let ack = state
        .uploads
        .receive_chunk(&claims.sub, &session_id, chunk_index, body, checksum)
        .await?;

    Ok(Json(ack))
}

#[utoipa::path(
    post,
    path = "/uploads/{session_id}/complete",
    request_body = CompleteUploadRequest,
    params(
        ("session_id" = String, Path, description = "Upload Session ID")
    ),
    responses(
        (status = 200, description = "Upload assembled", body = CompleteUploadResponse),
        (status = 404, description = "Session not found", body = ApiErrorBody),
        (status = 409, description = "Chunks missing, listed in missing_chunks", body = ApiErrorBody)
    ),
    security(
        ("jwt" = [])
    ),
    tag = "uploads"
)]
pub async fn complete_upload_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<Json<CompleteUploadResponse>, AppError> {
    let res = state
        .uploads
        .complete_session(&claims.sub, &session_id, req)
        .await?;
    Ok(Json(res))
}

#[utoipa::path(
    delete,
    path = "/uploads/{session_id}",
    params(
        ("session_id" = String, Path, description = "Upload Session ID")
    ),
    responses(
        (status = 204, description = "Upload aborted"),
        (status = 404, description = "Session not found", body = ApiErrorBody)
    ),
    security(
        ("jwt" = [])
    ),
    tag = "uploads"
)]
pub async fn abort_upload_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .uploads
        .abort_session(&claims.sub, &session_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
