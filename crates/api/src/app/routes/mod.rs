use std::sync::Arc;

use axum::Router;

use crate::app::errors;
use crate::app::services::AppServices;

pub mod backups;
pub mod courses;
pub mod jobs;
pub mod processes;
pub mod remote;
pub mod system;

/// Router for every resource except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/processes", processes::router())
        .nest("/jobs", jobs::router())
        .nest("/backups", backups::router())
        .nest("/courses", courses::router())
        .nest("/remote", remote::router())
}

/// Run a store call off the async workers; the stores block.
pub(crate) async fn blocking<T, F>(services: &Arc<AppServices>, f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce(&AppServices) -> T + Send + 'static,
    T: Send + 'static,
{
    let services = services.clone();
    tokio::task::spawn_blocking(move || f(&services))
        .await
        .map_err(errors::task_failed)
}
