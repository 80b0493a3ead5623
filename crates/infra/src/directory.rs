//! Read access to the host's course table.

use std::collections::BTreeMap;
use std::sync::RwLock;

use lcbackup_core::{Course, CourseId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CourseDirectoryError {
    #[error("course directory error: {0}")]
    Storage(String),
}

pub trait CourseDirectory: Send + Sync {
    fn find(&self, id: CourseId) -> Result<Option<Course>, CourseDirectoryError>;
}

/// Course table held in memory (tests, development).
#[derive(Debug, Default)]
pub struct InMemoryCourseDirectory {
    courses: RwLock<BTreeMap<CourseId, Course>>,
}

impl InMemoryCourseDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_courses(courses: impl IntoIterator<Item = Course>) -> Self {
        let directory = Self::new();
        for course in courses {
            directory.insert(course);
        }
        directory
    }

    pub fn insert(&self, course: Course) {
        if let Ok(mut courses) = self.courses.write() {
            courses.insert(course.id, course);
        }
    }

    pub fn remove(&self, id: CourseId) -> Option<Course> {
        self.courses.write().ok()?.remove(&id)
    }

    /// Next free course id, as a restore would allocate it.
    pub fn next_id(&self) -> CourseId {
        let last = self
            .courses
            .read()
            .ok()
            .and_then(|c| c.keys().next_back().map(|id| id.get()))
            .unwrap_or(1);
        CourseId::new(last + 1)
    }
}

impl CourseDirectory for InMemoryCourseDirectory {
    fn find(&self, id: CourseId) -> Result<Option<Course>, CourseDirectoryError> {
        let courses = self
            .courses
            .read()
            .map_err(|_| CourseDirectoryError::Storage("course table lock poisoned".to_string()))?;
        Ok(courses.get(&id).cloned())
    }
}
