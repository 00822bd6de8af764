//! Batch jobs derived from a task.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::meta::{ObjectMeta, Resource};

/// Role of a job within a task. The vocabulary is closed; anything else
/// found in a type label belongs to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Split,
    Count,
    Slice,
    Merge,
    Cleanup,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::Split,
        JobType::Count,
        JobType::Slice,
        JobType::Merge,
        JobType::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Split => "split",
            Self::Count => "count",
            Self::Slice => "slice",
            Self::Merge => "merge",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job type '{0}'")]
pub struct UnknownJobType(pub String);

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownJobType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub volume: String,
    pub mount_path: String,
}

/// What the batch platform runs: one container, its arguments and mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Condition reported by the batch platform. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Terminal completion signal; `None` while the job has not reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<JobCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

impl BatchJob {
    pub fn is_complete(&self) -> bool {
        self.status.complete == Some(true)
    }
}

impl Resource for BatchJob {
    const KIND: &'static str = "BatchJob";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("split", JobType::Split)]
    #[case("count", JobType::Count)]
    #[case("slice", JobType::Slice)]
    #[case("merge", JobType::Merge)]
    #[case("cleanup", JobType::Cleanup)]
    fn parses_known_types(#[case] raw: &str, #[case] expected: JobType) {
        assert_eq!(raw.parse::<JobType>(), Ok(expected));
        assert_eq!(expected.to_string(), raw);
    }

    #[rstest]
    #[case("")]
    #[case("Slice")]
    #[case("thumbnail")]
    fn rejects_foreign_types(#[case] raw: &str) {
        assert_eq!(raw.parse::<JobType>(), Err(UnknownJobType(raw.to_string())));
    }

    #[test]
    fn complete_requires_explicit_true() {
        let mut job = BatchJob {
            metadata: ObjectMeta::named("j"),
            spec: JobSpec {
                image: "img".into(),
                args: vec![],
                volume_mounts: vec![],
            },
            status: JobStatus::default(),
        };
        assert!(!job.is_complete());
        job.status.complete = Some(false);
        assert!(!job.is_complete());
        job.status.complete = Some(true);
        assert!(job.is_complete());
    }
}
