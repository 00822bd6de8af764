//! Controller configuration.
//!
//! Loaded once at startup from TOML and then shared read-only by the
//! orchestrator, the feedback handler and the driver. Every field has a
//! default, so an empty document is a valid configuration.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::JobType;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,
    /// Interval at which every task and job is re-enqueued.
    pub resync_period_secs: u64,
    /// Feedback handler attempts on write conflicts before giving up.
    pub conflict_retries: u32,
    pub requeue: RequeueConfig,
    pub labels: LabelConfig,
    pub templates: Templates,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period_secs: 60,
            conflict_retries: 5,
            requeue: RequeueConfig::default(),
            labels: LabelConfig::default(),
            templates: Templates::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.resync_period_secs == 0 {
            return Err(Error::Config("resync_period_secs must be at least 1".into()));
        }
        self.requeue.validate()?;
        self.labels.validate()?;
        for kind in JobType::ALL {
            if self.templates.get(kind).image.trim().is_empty() {
                return Err(Error::Config(format!("templates.{kind}.image is empty")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequeueConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_secs: 60,
        }
    }
}

impl RequeueConfig {
    fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "requeue.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if Duration::from_millis(self.base_delay_ms) > Duration::from_secs(self.max_delay_secs) {
            return Err(Error::Config(
                "requeue.base_delay_ms exceeds requeue.max_delay_secs".into(),
            ));
        }
        Ok(())
    }
}

/// Label keys stamped on every job and read back by the feedback handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabelConfig {
    pub job_type: String,
    pub task_id: String,
    pub slice_index: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            job_type: "splitcode.io/job-type".into(),
            task_id: "splitcode.io/task-id".into(),
            slice_index: "splitcode.io/slice-index".into(),
        }
    }
}

impl LabelConfig {
    fn validate(&self) -> Result<()> {
        let keys = [&self.job_type, &self.task_id, &self.slice_index];
        if keys.iter().any(|k| k.trim().is_empty()) {
            return Err(Error::Config("label keys must not be empty".into()));
        }
        let unique: HashSet<_> = keys.iter().collect();
        if unique.len() != keys.len() {
            return Err(Error::Config("label keys must be distinct".into()));
        }
        Ok(())
    }
}

/// Container image and argument template for one job type.
///
/// Arguments may contain `{placeholder}`s, substituted per task when the
/// job is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobTemplate {
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl JobTemplate {
    fn new(image: &str, args: &[&str]) -> Self {
        Self {
            image: image.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Templates {
    pub split: JobTemplate,
    pub count: JobTemplate,
    pub slice: JobTemplate,
    pub merge: JobTemplate,
    pub cleanup: JobTemplate,
}

impl Templates {
    pub fn get(&self, kind: JobType) -> &JobTemplate {
        match kind {
            JobType::Split => &self.split,
            JobType::Count => &self.count,
            JobType::Slice => &self.slice,
            JobType::Merge => &self.merge,
            JobType::Cleanup => &self.cleanup,
        }
    }
}

const TOOLBOX_IMAGE: &str = "ghcr.io/splitcode/toolbox:latest";
const ENCODER_IMAGE: &str = "ghcr.io/splitcode/encoder:latest";

impl Default for Templates {
    fn default() -> Self {
        Self {
            split: JobTemplate::new(
                TOOLBOX_IMAGE,
                &[
                    "split",
                    "--input",
                    "{source}",
                    "--output-dir",
                    "{work_dir}/segments",
                    "--segment-seconds",
                    "{segment_seconds}",
                ],
            ),
            count: JobTemplate::new(
                TOOLBOX_IMAGE,
                &["count", "--task", "{task_name}", "--segments-dir", "{work_dir}/segments"],
            ),
            slice: JobTemplate::new(
                ENCODER_IMAGE,
                &[
                    "encode",
                    "--input",
                    "{work_dir}/segments/{slice_index}.mkv",
                    "--output",
                    "{work_dir}/encoded/{slice_index}.mkv",
                ],
            ),
            merge: JobTemplate::new(
                TOOLBOX_IMAGE,
                &[
                    "merge",
                    "--input-dir",
                    "{work_dir}/encoded",
                    "--count",
                    "{slice_count}",
                    "--output",
                    "{target}",
                ],
            ),
            cleanup: JobTemplate::new(
                TOOLBOX_IMAGE,
                &[
                    "cleanup",
                    "--work-dir",
                    "{work_dir}",
                    "--source",
                    "{source}",
                    "--delete-source",
                    "{delete_source}",
                ],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.workers, 4);
        assert_eq!(config.resync_period(), Duration::from_secs(60));
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = ControllerConfig::from_toml_str(
            r#"
            workers = 8

            [labels]
            task_id = "example.com/task"

            [templates.slice]
            image = "registry.local/x265:3"
            args = ["--crf", "22"]
            "#,
        )
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.labels.task_id, "example.com/task");
        assert_eq!(config.labels.job_type, LabelConfig::default().job_type);
        assert_eq!(config.templates.slice.image, "registry.local/x265:3");
        assert_eq!(config.templates.merge, Templates::default().merge);
    }

    #[rstest]
    #[case::zero_workers("workers = 0", "workers")]
    #[case::zero_resync("resync_period_secs = 0", "resync_period_secs")]
    #[case::shrinking_backoff("[requeue]\nmultiplier = 0.5", "multiplier")]
    #[case::base_over_max("[requeue]\nbase_delay_ms = 120000\nmax_delay_secs = 60", "base_delay_ms")]
    #[case::empty_label("[labels]\nslice_index = \"\"", "label keys")]
    #[case::duplicate_label("[labels]\ntask_id = \"splitcode.io/job-type\"", "distinct")]
    #[case::empty_image("[templates.merge]\nimage = \" \"", "templates.merge.image")]
    fn invalid_documents_fail_fast(#[case] raw: &str, #[case] needle: &str) {
        let err = ControllerConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ControllerConfig::from_toml_str("wrokers = 2").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn printed_config_parses_back() {
        let config = ControllerConfig::default();
        let printed = config.to_toml_string().unwrap();
        assert_eq!(ControllerConfig::from_toml_str(&printed).unwrap(), config);
    }
}
