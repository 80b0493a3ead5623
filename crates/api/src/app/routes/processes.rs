use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use lcbackup_core::ProcessId;
use lcbackup_infra::jobs::JobPayload;

use super::blocking;
use crate::app::dto::BackupRequest;
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:process_id/backup", post(request_backup).get(poll_backup))
}

fn parse_process(raw: &str) -> Result<ProcessId, axum::response::Response> {
    raw.parse::<ProcessId>()
        .ok()
        .and_then(|id| id.ensure_valid().ok())
        .ok_or_else(|| errors::invalid_id("process"))
}

pub async fn request_backup(
    Extension(services): Extension<Arc<AppServices>>,
    Path(process_id): Path<String>,
    body: Result<Json<BackupRequest>, JsonRejection>,
) -> axum::response::Response {
    let process_id = match parse_process(&process_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    let payload = JobPayload::new(process_id, body.instance_id, body.settings());
    let course_id = body.course_id;
    let result = match blocking(&services, move |s| {
        s.bridge().enqueue_backup(process_id, course_id, payload)
    })
    .await
    {
        Ok(result) => result,
        Err(resp) => return resp,
    };

    match result {
        Ok(requested) => {
            let status = if requested.existing { StatusCode::OK } else { StatusCode::ACCEPTED };
            (status, Json(requested)).into_response()
        }
        Err(e) => errors::bridge_error_to_response(e),
    }
}

pub async fn poll_backup(
    Extension(services): Extension<Arc<AppServices>>,
    Path(process_id): Path<String>,
) -> axum::response::Response {
    let process_id = match parse_process(&process_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match blocking(&services, move |s| s.bridge().poll_backup(process_id)).await {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => errors::bridge_error_to_response(e),
        Err(resp) => resp,
    }
}
