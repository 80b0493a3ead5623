use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use lcbackup_core::S3Settings;
use lcbackup_infra::upload::{ConnectionStatus, UploadError};

use super::blocking;
use crate::app::errors;
use crate::app::services::{AppServices, CONNECTION_CHECK_TIMEOUT};

pub fn router() -> Router {
    Router::new()
        .route("/status", get(remote_status))
        .route("/check", post(check_remote))
}

/// Connectivity check against the default bucket.
pub async fn remote_status(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    respond(blocking(&services, |s| check(s, None)).await)
}

/// Connectivity check against a step instance's remote settings.
pub async fn check_remote(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<S3Settings>, JsonRejection>,
) -> axum::response::Response {
    let Json(settings) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    if let Err(e) = settings.validate() {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_settings", e.to_string());
    }
    respond(blocking(&services, move |s| check(s, Some(&settings))).await)
}

fn check(services: &AppServices, remote: Option<&S3Settings>) -> Result<ConnectionStatus, UploadError> {
    match services.upload() {
        Some(upload) => upload.check_connection(remote, CONNECTION_CHECK_TIMEOUT),
        None => Err(UploadError::NotConfigured("uploads are disabled".to_string())),
    }
}

fn respond(result: Result<Result<ConnectionStatus, UploadError>, axum::response::Response>) -> axum::response::Response {
    match result {
        Ok(Ok(status)) => {
            let code = if status.success { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
            (code, Json(status)).into_response()
        }
        Ok(Err(UploadError::NotConfigured(msg))) => {
            errors::json_error(StatusCode::NOT_FOUND, "upload_not_configured", msg)
        }
        Ok(Err(e)) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "upload_error", e.to_string()),
        Err(resp) => resp,
    }
}
