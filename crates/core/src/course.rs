//! Course vocabulary shared with the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::CourseId;
use crate::options::BackupOptions;

/// The host's view of a course, as far as backups care.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub shortname: String,
    pub fullname: String,
}

impl Course {
    pub fn new(id: CourseId, shortname: impl Into<String>, fullname: impl Into<String>) -> Self {
        Self {
            id,
            shortname: shortname.into(),
            fullname: fullname.into(),
        }
    }
}

/// Default archive filename, following the archive engine's naming scheme:
/// `backup-moodle2-course-<id>-<shortname>-<yyyymmdd-hhmm>[-nu][-an].mbz`.
///
/// `-nu` marks a backup without user data, `-an` an anonymized one.
pub fn default_archive_filename(course: &Course, options: &BackupOptions, at: DateTime<Utc>) -> String {
    let mut name = format!(
        "backup-moodle2-course-{}-{}-{}",
        course.id,
        clean_shortname(&course.shortname),
        at.format("%Y%m%d-%H%M"),
    );
    if !options.includes_users() {
        name.push_str("-nu");
    }
    if options.anonymized() {
        name.push_str("-an");
    }
    name.push_str(".mbz");
    name
}

fn clean_shortname(shortname: &str) -> String {
    shortname
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            c if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') => Some(c),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BackupOption;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 10, 9, 5, 0).unwrap()
    }

    #[test]
    fn filename_follows_engine_convention() {
        let course = Course::new(CourseId::new(42), "Intro Bio", "Introduction to Biology");
        let name = default_archive_filename(&course, &BackupOptions::default(), at());
        assert_eq!(name, "backup-moodle2-course-42-intro_bio-20241010-0905.mbz");
    }

    #[test]
    fn filename_marks_no_users_and_anonymized() {
        let course = Course::new(CourseId::new(7), "C/7", "Course seven");
        let options = BackupOptions::default()
            .with(BackupOption::Users, false)
            .with(BackupOption::Anonymize, true);
        let name = default_archive_filename(&course, &options, at());
        assert_eq!(name, "backup-moodle2-course-7-c7-20241010-0905-nu-an.mbz");
    }

    proptest! {
        #[test]
        fn filename_never_contains_path_separators(shortname in ".{0,40}") {
            let course = Course::new(CourseId::new(1), shortname, "x");
            let name = default_archive_filename(&course, &BackupOptions::default(), at());
            prop_assert!(!name.contains('/'));
            prop_assert!(!name.contains('\\'));
            prop_assert!(name.ends_with(".mbz"));
        }
    }
}
