use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use lcbackup_core::CourseId;

use super::blocking;
use crate::app::dto::UploadsResponse;
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:course_id/uploads", get(list_uploads))
}

/// Upload audit trail of one course.
pub async fn list_uploads(
    Extension(services): Extension<Arc<AppServices>>,
    Path(course_id): Path<String>,
) -> axum::response::Response {
    let Some(course_id) = course_id
        .parse::<CourseId>()
        .ok()
        .filter(|id| id.ensure_valid().is_ok())
    else {
        return errors::invalid_id("course");
    };

    let result = blocking(&services, move |s| {
        s.upload().map(|upload| upload.records().list_for_course(course_id))
    })
    .await;

    match result {
        Ok(Some(Ok(items))) => Json(UploadsResponse { course_id, items }).into_response(),
        Ok(Some(Err(e))) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
        Ok(None) => Json(UploadsResponse {
            course_id,
            items: Vec::new(),
        })
        .into_response(),
        Err(resp) => resp,
    }
}
