//! Backup option set handed verbatim to the archive engine.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A named boolean backup-content flag understood by the archive engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackupOption {
    Users,
    Anonymize,
    RoleAssignments,
    Activities,
    Blocks,
    Files,
    Filters,
    Comments,
    Badges,
    CalendarEvents,
    UsersCompletion,
    Logs,
    GradeHistories,
    QuestionBank,
    Groups,
    Competencies,
    ContentBankContent,
    LegacyFiles,
}

impl BackupOption {
    pub const ALL: [BackupOption; 18] = [
        BackupOption::Users,
        BackupOption::Anonymize,
        BackupOption::RoleAssignments,
        BackupOption::Activities,
        BackupOption::Blocks,
        BackupOption::Files,
        BackupOption::Filters,
        BackupOption::Comments,
        BackupOption::Badges,
        BackupOption::CalendarEvents,
        BackupOption::UsersCompletion,
        BackupOption::Logs,
        BackupOption::GradeHistories,
        BackupOption::QuestionBank,
        BackupOption::Groups,
        BackupOption::Competencies,
        BackupOption::ContentBankContent,
        BackupOption::LegacyFiles,
    ];

    /// Engine-side setting name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupOption::Users => "users",
            BackupOption::Anonymize => "anonymize",
            BackupOption::RoleAssignments => "role_assignments",
            BackupOption::Activities => "activities",
            BackupOption::Blocks => "blocks",
            BackupOption::Files => "files",
            BackupOption::Filters => "filters",
            BackupOption::Comments => "comments",
            BackupOption::Badges => "badges",
            BackupOption::CalendarEvents => "calendarevents",
            BackupOption::UsersCompletion => "userscompletion",
            BackupOption::Logs => "logs",
            BackupOption::GradeHistories => "grade_histories",
            BackupOption::QuestionBank => "questionbank",
            BackupOption::Groups => "groups",
            BackupOption::Competencies => "competencies",
            BackupOption::ContentBankContent => "contentbankcontent",
            BackupOption::LegacyFiles => "legacyfiles",
        }
    }

    /// Value used when the step instance does not set the option.
    pub fn default_value(&self) -> bool {
        !matches!(self, BackupOption::Anonymize)
    }
}

impl core::fmt::Display for BackupOption {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupOption {
    type Err = DomainError;

    /// Accepts both the bare name and the `backup_`-prefixed settings key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("backup_").unwrap_or(s);
        BackupOption::ALL
            .iter()
            .copied()
            .find(|o| o.as_str() == name)
            .ok_or_else(|| DomainError::UnknownOption(s.to_string()))
    }
}

impl TryFrom<String> for BackupOption {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackupOption> for String {
    fn from(value: BackupOption) -> Self {
        value.as_str().to_string()
    }
}

/// Complete option set for one backup.
///
/// Always holds a value for every [`BackupOption`]; options missing from the
/// serialized form fall back to [`BackupOption::default_value`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<BackupOption, bool>", into = "BTreeMap<BackupOption, bool>")]
pub struct BackupOptions {
    values: BTreeMap<BackupOption, bool>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            values: BackupOption::ALL
                .iter()
                .map(|o| (*o, o.default_value()))
                .collect(),
        }
    }
}

impl From<BTreeMap<BackupOption, bool>> for BackupOptions {
    fn from(overrides: BTreeMap<BackupOption, bool>) -> Self {
        let mut options = Self::default();
        options.values.extend(overrides);
        options
    }
}

impl From<BackupOptions> for BTreeMap<BackupOption, bool> {
    fn from(value: BackupOptions) -> Self {
        value.values
    }
}

impl BackupOptions {
    /// Build from raw `(name, value)` settings pairs. Unknown names are rejected.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = (K, bool)>,
        K: AsRef<str>,
    {
        let mut options = Self::default();
        for (name, value) in pairs {
            options.set(name.as_ref().parse()?, value);
        }
        Ok(options)
    }

    pub fn get(&self, option: BackupOption) -> bool {
        self.values
            .get(&option)
            .copied()
            .unwrap_or_else(|| option.default_value())
    }

    pub fn set(&mut self, option: BackupOption, value: bool) {
        self.values.insert(option, value);
    }

    pub fn with(mut self, option: BackupOption, value: bool) -> Self {
        self.set(option, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (BackupOption, bool)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    pub fn includes_users(&self) -> bool {
        self.get(BackupOption::Users)
    }

    pub fn anonymized(&self) -> bool {
        self.get(BackupOption::Anonymize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn defaults_match_step_form() {
        let options = BackupOptions::default();
        assert!(options.includes_users());
        assert!(!options.anonymized());
        assert_eq!(options.iter().filter(|(_, v)| *v).count(), 17);
    }

    #[test]
    fn prefixed_settings_keys_are_accepted() {
        let options =
            BackupOptions::from_pairs([("backup_users", false), ("grade_histories", false)]).unwrap();
        assert!(!options.get(BackupOption::Users));
        assert!(!options.get(BackupOption::GradeHistories));
        assert!(options.get(BackupOption::Logs));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = BackupOptions::from_pairs([("backup_everything", true)]).unwrap_err();
        assert_eq!(err, DomainError::UnknownOption("backup_everything".to_string()));

        let json = serde_json::json!({ "users": true, "nonsense": false });
        assert!(serde_json::from_value::<BackupOptions>(json).is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = serde_json::json!({ "anonymize": true, "calendarevents": false });
        let options: BackupOptions = serde_json::from_value(json).unwrap();
        assert!(options.anonymized());
        assert!(!options.get(BackupOption::CalendarEvents));
        assert!(options.get(BackupOption::QuestionBank));

        let back = serde_json::to_value(&options).unwrap();
        assert_eq!(back.as_object().unwrap().len(), BackupOption::ALL.len());
    }

    proptest! {
        #[test]
        fn every_option_name_parses_back(idx in 0usize..18, prefixed in any::<bool>()) {
            let option = BackupOption::ALL[idx];
            let name = if prefixed {
                format!("backup_{}", option.as_str())
            } else {
                option.as_str().to_string()
            };
            prop_assert_eq!(name.parse::<BackupOption>().unwrap(), option);
        }

        #[test]
        fn overrides_win_over_defaults(idx in 0usize..18, value in any::<bool>()) {
            let option = BackupOption::ALL[idx];
            let options = BackupOptions::default().with(option, value);
            prop_assert_eq!(options.get(option), value);
        }
    }
}
