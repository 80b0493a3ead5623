use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use lcbackup_core::CatalogEntryId;

use super::blocking;
use crate::app::dto::{ListBackupsQuery, RestoreResponse};
use crate::app::errors;
use crate::app::services::AppServices;

const BACKUP_CONTENT_TYPE: &str = "application/vnd.moodle.backup";

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_backups))
        .route("/:id", axum::routing::delete(delete_backup))
        .route("/:id/download", get(download_backup))
        .route("/:id/restore", post(restore_backup))
}

fn parse_entry(raw: &str) -> Result<CatalogEntryId, axum::response::Response> {
    raw.parse().map_err(|_| errors::invalid_id("backup"))
}

pub async fn list_backups(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListBackupsQuery>,
) -> axum::response::Response {
    let (filter, page) = (query.filter(), query.page());
    match blocking(&services, move |s| s.catalog().list(&filter, page)).await {
        Ok(Ok(entries)) => Json(serde_json::json!({
            "items": entries,
            "limit": page.limit,
            "offset": page.offset,
        }))
        .into_response(),
        Ok(Err(e)) => errors::catalog_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn download_backup(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_entry(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match blocking(&services, move |s| s.catalog().download(id)).await {
        Ok(Ok((entry, content))) => {
            let disposition = format!("attachment; filename=\"{}\"", entry.filename.replace('"', ""));
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, BACKUP_CONTENT_TYPE.to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                content,
            )
                .into_response()
        }
        Ok(Err(e)) => errors::catalog_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn restore_backup(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_entry(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match blocking(&services, move |s| s.catalog().restore(id)).await {
        Ok(Ok(course_id)) => (StatusCode::CREATED, Json(RestoreResponse { course_id })).into_response(),
        Ok(Err(e)) => errors::catalog_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn delete_backup(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_entry(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match blocking(&services, move |s| s.catalog().delete(id)).await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => errors::catalog_error_to_response(e),
        Err(resp) => resp,
    }
}
