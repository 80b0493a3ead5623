use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use lcbackup_core::JobId;

use super::blocking;
use crate::app::dto::{job_view, JobStatsResponse};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job).delete(delete_job))
}

fn parse_job(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse().map_err(|_| errors::invalid_id("job"))
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match blocking(&services, move |s| s.queue().get(job_id)).await {
        Ok(Ok(Some(job))) => Json(job_view(job)).into_response(),
        Ok(Ok(None)) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(resp) => resp,
    }
}

/// Remove a job in any state. Its process proceeds on the next poll.
pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match blocking(&services, move |s| s.queue().delete(job_id)).await {
        Ok(Ok(true)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Ok(false)) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match blocking(&services, |s| s.queue().stats().map(|queue| (queue, s.runner_stats()))).await {
        Ok(Ok((queue, runners))) => Json(JobStatsResponse { queue, runners }).into_response(),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(resp) => resp,
    }
}
