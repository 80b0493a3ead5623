use sqlx::Row;
use tracing::instrument;

use lcbackup_core::{Course, CourseId};

use super::{describe, is_identifier, PgContext};
use crate::directory::{CourseDirectory, CourseDirectoryError};

/// Reads the host's course table (`<prefix>course`).
#[derive(Debug, Clone)]
pub struct PostgresCourseDirectory {
    cx: PgContext,
    query: String,
}

impl PostgresCourseDirectory {
    pub fn new(cx: PgContext, table: &str) -> Result<Self, CourseDirectoryError> {
        if !is_identifier(table) {
            return Err(CourseDirectoryError::Storage(format!(
                "course table {table:?} is not an identifier"
            )));
        }
        Ok(Self {
            cx,
            query: format!("SELECT id, shortname, fullname FROM {table} WHERE id = $1"),
        })
    }

    #[instrument(skip(self), err)]
    pub async fn find_course(&self, id: CourseId) -> Result<Option<Course>, CourseDirectoryError> {
        let row = sqlx::query(&self.query)
            .bind(id.get())
            .fetch_optional(self.cx.pool())
            .await
            .map_err(|e| CourseDirectoryError::Storage(describe("find", &e)))?;
        row.map(|row| {
            Ok(Course::new(
                CourseId::new(row.try_get("id")?),
                row.try_get::<String, _>("shortname")?,
                row.try_get::<String, _>("fullname")?,
            ))
        })
        .transpose()
        .map_err(|e: sqlx::Error| CourseDirectoryError::Storage(describe("find", &e)))
    }
}

impl CourseDirectory for PostgresCourseDirectory {
    fn find(&self, id: CourseId) -> Result<Option<Course>, CourseDirectoryError> {
        self.cx.block_on(self.find_course(id))
    }
}
