use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use lcbackup_infra::catalog::CatalogError;
use lcbackup_infra::jobs::JobQueueError;
use lcbackup_infra::process::BridgeError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn queue_error_to_response(err: JobQueueError) -> axum::response::Response {
    match err {
        JobQueueError::InvalidPayload(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_payload", msg),
        JobQueueError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        JobQueueError::InvalidTransition(e) => json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string()),
        JobQueueError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn bridge_error_to_response(err: BridgeError) -> axum::response::Response {
    match err {
        BridgeError::InvalidPayload(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_payload", msg),
        BridgeError::Queue(e) => queue_error_to_response(e),
        BridgeError::Links(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub fn catalog_error_to_response(err: CatalogError) -> axum::response::Response {
    match err {
        CatalogError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        CatalogError::NotABackup(_) => json_error(StatusCode::CONFLICT, "not_a_backup", err.to_string()),
        CatalogError::Restore(e) => json_error(StatusCode::BAD_GATEWAY, "restore_failed", e.to_string()),
        CatalogError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
        CatalogError::Blob(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "blob_error", e.to_string()),
    }
}

pub fn json_rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text())
}

pub fn invalid_id(what: &'static str) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id"))
}

pub fn task_failed(err: tokio::task::JoinError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
}
