//! Building the batch jobs a task needs.

use tracing::{debug, info};

use crate::config::{ControllerConfig, JobTemplate, LabelConfig, Templates};
use crate::domain::{
    BatchJob, JobSpec, JobStatus, JobType, LabelSelector, ObjectMeta, OwnerReference, Resource,
    TaskId, TranscodeTask, VolumeMount,
};
use crate::error::Result;
use crate::ports::Api;

/// Deterministic job name: `{taskId}-{type}` or `{taskId}-slice-{index}`.
pub fn job_name(task_id: TaskId, kind: JobType, slice_index: Option<u32>) -> String {
    match slice_index {
        Some(index) => format!("{task_id}-{kind}-{index}"),
        None => format!("{task_id}-{kind}"),
    }
}

/// Turns a task plus the configured templates into job objects.
#[derive(Debug, Clone)]
pub struct JobFactory {
    labels: LabelConfig,
    templates: Templates,
}

impl JobFactory {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            labels: config.labels.clone(),
            templates: config.templates.clone(),
        }
    }

    pub fn labels(&self) -> &LabelConfig {
        &self.labels
    }

    /// Selects every job belonging to `task_id`.
    pub fn task_selector(&self, task_id: TaskId) -> LabelSelector {
        LabelSelector::everything().with(&self.labels.task_id, task_id.to_string())
    }

    pub fn build(&self, task: &TranscodeTask, kind: JobType) -> BatchJob {
        self.render(task, kind, None)
    }

    pub fn slice(&self, task: &TranscodeTask, index: u32) -> BatchJob {
        self.render(task, JobType::Slice, Some(index))
    }

    fn render(&self, task: &TranscodeTask, kind: JobType, slice_index: Option<u32>) -> BatchJob {
        let task_id = task.task_id();
        let mut metadata = ObjectMeta::named(job_name(task_id, kind, slice_index));
        metadata
            .labels
            .insert(self.labels.job_type.clone(), kind.to_string());
        metadata
            .labels
            .insert(self.labels.task_id.clone(), task_id.to_string());
        if let Some(index) = slice_index {
            metadata
                .labels
                .insert(self.labels.slice_index.clone(), index.to_string());
        }
        metadata.owner = Some(OwnerReference {
            kind: TranscodeTask::KIND.to_string(),
            name: task.name().to_string(),
            controller: true,
        });

        let template = self.templates.get(kind);
        let vars = Vars::of(task, slice_index);
        let mut args: Vec<String> = template.args.iter().map(|a| vars.apply(a)).collect();
        let image = match kind {
            JobType::Slice => {
                args.extend(task.spec.encode.extra_args.iter().cloned());
                task.spec
                    .encode
                    .image
                    .clone()
                    .unwrap_or_else(|| template.image.clone())
            }
            _ => template.image.clone(),
        };

        BatchJob {
            metadata,
            spec: JobSpec {
                image,
                args,
                volume_mounts: vec![VolumeMount {
                    volume: task.spec.storage.volume.clone(),
                    mount_path: task.spec.storage.mount_path.clone(),
                }],
            },
            status: JobStatus::default(),
        }
    }

    pub fn template(&self, kind: JobType) -> &JobTemplate {
        self.templates.get(kind)
    }
}

/// Placeholder values for one task (and slice).
struct Vars(Vec<(&'static str, String)>);

impl Vars {
    fn of(task: &TranscodeTask, slice_index: Option<u32>) -> Self {
        let spec = &task.spec;
        Self(vec![
            ("task_id", spec.task_id.to_string()),
            ("task_name", task.name().to_string()),
            ("source", spec.source.resolve()),
            ("target", spec.target.resolve()),
            ("work_dir", task.work_dir()),
            (
                "slice_index",
                slice_index.map(|i| i.to_string()).unwrap_or_default(),
            ),
            ("slice_count", task.status.slices_planned_count.to_string()),
            ("segment_seconds", spec.encode.segment_seconds.to_string()),
            ("delete_source", spec.cleanup.delete_source.to_string()),
        ])
    }

    fn apply(&self, arg: &str) -> String {
        if !arg.contains('{') {
            return arg.to_string();
        }
        self.0.iter().fold(arg.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{key}}}"), value)
        })
    }
}

/// Create `job` unless it already exists.
///
/// Returns `true` if this call created it. `AlreadyExists` is success: a
/// previous pass created the job but its status write was lost, or another
/// delivery raced this one.
pub async fn ensure_job(jobs: &dyn Api<BatchJob>, job: BatchJob) -> Result<bool> {
    let name = job.metadata.name.clone();
    match jobs.create(job).await {
        Ok(_) => {
            info!(job = %name, "created job");
            Ok(true)
        }
        Err(e) if e.is_already_exists() => {
            debug!(job = %name, "job already exists");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{
        CleanupSpec, ConcurrencyStrategy, EncodeSpec, MediaUrl, StorageSpec, TaskSpec,
    };
    use crate::impls::InMemoryApi;
    use ulid::Ulid;

    pub(crate) fn sample_task(name: &str, cap: Option<u32>) -> TranscodeTask {
        TranscodeTask::new(
            name,
            TaskSpec {
                task_id: TaskId::from_ulid(Ulid::from_parts(1_700_000_000_000, 42)),
                source: MediaUrl::new("/mnt/media/in", "movies/big.mkv"),
                target: MediaUrl::new("/mnt/media/out/", "/movies/big.mp4"),
                storage: StorageSpec {
                    volume: "media".into(),
                    mount_path: "/mnt/media".into(),
                },
                encode: EncodeSpec::default(),
                cleanup: CleanupSpec {
                    delete_source: true,
                },
                concurrency: cap.map(|max_count| ConcurrencyStrategy { max_count }),
            },
        )
    }

    #[test]
    fn names_are_derived_from_task_id() {
        let task = sample_task("big", None);
        let id = task.task_id();
        assert_eq!(job_name(id, JobType::Merge, None), format!("{id}-merge"));
        assert_eq!(job_name(id, JobType::Slice, Some(7)), format!("{id}-slice-7"));
    }

    #[test]
    fn jobs_carry_labels_owner_and_mount() {
        let factory = JobFactory::new(&ControllerConfig::default());
        let task = sample_task("big", None);
        let job = factory.slice(&task, 3);

        let labels = factory.labels();
        assert_eq!(job.metadata.label(&labels.job_type), Some("slice"));
        assert_eq!(
            job.metadata.label(&labels.task_id),
            Some(task.task_id().to_string().as_str())
        );
        assert_eq!(job.metadata.label(&labels.slice_index), Some("3"));

        let owner = job.metadata.owner.as_ref().unwrap();
        assert_eq!(owner.kind, "TranscodeTask");
        assert_eq!(owner.name, "big");
        assert!(owner.controller);

        assert_eq!(job.spec.volume_mounts[0].mount_path, "/mnt/media");
        assert!(factory.task_selector(task.task_id()).matches(&job.metadata.labels));
    }

    #[test]
    fn templates_are_rendered_per_task() {
        let factory = JobFactory::new(&ControllerConfig::default());
        let mut task = sample_task("big", None);
        task.status.slices_planned_count = 12;
        let work_dir = task.work_dir();

        let merge = factory.build(&task, JobType::Merge);
        assert!(merge.spec.args.contains(&"12".to_string()));
        assert!(merge.spec.args.contains(&"/mnt/media/out/movies/big.mp4".to_string()));
        assert!(merge.spec.args.contains(&format!("{work_dir}/encoded")));

        let cleanup = factory.build(&task, JobType::Cleanup);
        assert!(cleanup.spec.args.contains(&"true".to_string()));
        assert!(cleanup.spec.args.iter().all(|a| !a.contains('{')));
    }

    #[test]
    fn slice_image_and_extra_args_come_from_the_task() {
        let factory = JobFactory::new(&ControllerConfig::default());
        let mut task = sample_task("big", None);
        task.spec.encode.image = Some("registry.local/av1:1".into());
        task.spec.encode.extra_args = vec!["--crf".into(), "30".into()];

        let slice = factory.slice(&task, 0);
        assert_eq!(slice.spec.image, "registry.local/av1:1");
        assert_eq!(slice.spec.args[slice.spec.args.len() - 2..], ["--crf", "30"]);

        let split = factory.build(&task, JobType::Split);
        assert_eq!(split.spec.image, factory.template(JobType::Split).image);
    }

    #[tokio::test]
    async fn ensure_job_treats_existing_as_success() {
        let jobs = InMemoryApi::<BatchJob>::new();
        let factory = JobFactory::new(&ControllerConfig::default());
        let task = sample_task("big", None);

        assert!(ensure_job(&jobs, factory.build(&task, JobType::Split)).await.unwrap());
        assert!(!ensure_job(&jobs, factory.build(&task, JobType::Split)).await.unwrap());
        assert_eq!(jobs.len().await, 1);
    }
}
