use thiserror::Error;

/// Errors raised by the store port, the job factory and the reconcile steps.
///
/// Classification matters more than the message: the driver retries
/// transient errors, steps treat `AlreadyExists` on create as success and
/// `NotFound` on a dependent fetch as "nothing to do".
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} '{name}' was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("job '{job}' is missing label '{label}'")]
    MissingLabel { job: String, label: String },

    #[error("job '{job}' has invalid label '{label}'='{value}'")]
    InvalidLabel {
        job: String,
        label: String,
        value: String,
    },

    #[error("task '{task}' is in an invalid state: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid_task(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTask {
            task: task.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Errors that say nothing about the task itself and go away on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Conflict { .. } | Self::Backend(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_transient_but_invalid_task_is_not() {
        let conflict = Error::Conflict {
            kind: "TranscodeTask",
            name: "movie".into(),
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_conflict());
        assert!(conflict.is_transient());

        let invalid = Error::invalid_task("movie", "zero slices");
        assert!(!invalid.is_transient());
        assert!(invalid.to_string().contains("zero slices"));
    }

    #[test]
    fn already_exists_message_names_the_object() {
        let err = Error::already_exists("BatchJob", "task-01-split");
        assert!(err.is_already_exists());
        assert_eq!(err.to_string(), "BatchJob 'task-01-split' already exists");
    }
}
