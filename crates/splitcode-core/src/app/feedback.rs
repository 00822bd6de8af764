//! Job feedback handler: maps one completed job onto its task's status.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use super::jobs::{JobFactory, ensure_job};
use crate::config::{ControllerConfig, LabelConfig};
use crate::domain::{BatchJob, Condition, ConditionType, JobType, Resource, TaskStatus, TranscodeTask};
use crate::error::{Error, Result};
use crate::pipeline::{Flow, Pipeline, PipelineError, RunReport, Stage, Step, from_fn};
use crate::ports::{Api, Clock};

#[derive(Debug)]
pub struct FeedbackContext {
    pub job_name: String,
    pub job: Option<BatchJob>,
    pub kind: Option<JobType>,
    pub task: Option<TranscodeTask>,
    before: Option<TaskStatus>,
    /// Whether the task status was written.
    pub updated: bool,
}

impl FeedbackContext {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            job: None,
            kind: None,
            task: None,
            before: None,
            updated: false,
        }
    }

    fn is(&self, kind: JobType) -> bool {
        self.kind == Some(kind)
    }
}

/// Outcome of one delivery.
#[derive(Debug, Clone)]
pub struct Feedback {
    pub run: RunReport,
    pub kind: Option<JobType>,
    pub task_updated: bool,
    /// Number of pipeline runs, more than one after write conflicts.
    pub attempts: u32,
}

pub struct JobFeedbackHandler {
    pipeline: Pipeline<FeedbackContext>,
    conflict_retries: u32,
}

impl JobFeedbackHandler {
    pub fn new(
        tasks: Arc<dyn Api<TranscodeTask>>,
        jobs: Arc<dyn Api<BatchJob>>,
        config: &ControllerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let factory = JobFactory::new(config);
        let labels = config.labels.clone();
        let mut p = Pipeline::new("job-feedback");

        let fetched = p.push(Stage::new(FetchJob { jobs: jobs.clone() }));
        let classified = p.push(Stage::new(Classify { labels: labels.clone() }).requires(&[fetched]));
        p.push(
            Stage::new(from_fn("check-complete", |ctx: &mut FeedbackContext| {
                match &ctx.job {
                    Some(job) if job.is_complete() => Ok(Flow::Continue),
                    _ => Ok(Flow::halt("job has not completed")),
                }
            }))
            .requires(&[fetched]),
        );
        let owner = p.push(Stage::new(FetchOwner { tasks: tasks.clone() }).requires(&[fetched]));

        p.group(
            "split-finished",
            |ctx: &FeedbackContext| ctx.is(JobType::Split),
            |g| {
                g.push(
                    Stage::new(EnsureCountJob {
                        jobs: jobs.clone(),
                        factory,
                    })
                    .when(|ctx: &FeedbackContext| {
                        ctx.task
                            .as_ref()
                            .is_some_and(|t| !t.status.is_true(ConditionType::CountComplete))
                    })
                    .requires(&[owner]),
                );
                g.push(
                    Stage::new(SetCondition::new(
                        ConditionType::SplitComplete,
                        "SplitFinished",
                        &clock,
                    ))
                    .requires(&[owner]),
                );
            },
        );

        p.group(
            "count-finished",
            |ctx: &FeedbackContext| ctx.is(JobType::Count),
            |g| {
                g.push(
                    Stage::new(SetCondition::new(
                        ConditionType::CountComplete,
                        "SlicesCounted",
                        &clock,
                    ))
                    .requires(&[owner]),
                );
            },
        );

        p.group(
            "slice-finished",
            |ctx: &FeedbackContext| ctx.is(JobType::Slice),
            |g| {
                g.push(
                    Stage::new(FinishSlice {
                        labels,
                        clock: clock.clone(),
                    })
                    .requires(&[classified, owner]),
                );
            },
        );

        p.group(
            "merge-finished",
            |ctx: &FeedbackContext| ctx.is(JobType::Merge),
            |g| {
                g.push(
                    Stage::new(SetCondition::new(
                        ConditionType::MergeComplete,
                        "MergeFinished",
                        &clock,
                    ))
                    .requires(&[owner]),
                );
            },
        );

        p.group(
            "cleanup-finished",
            |ctx: &FeedbackContext| ctx.is(JobType::Cleanup),
            |g| {
                g.push(
                    Stage::new(SetCondition::new(ConditionType::Ready, "CleanedUp", &clock))
                        .requires(&[owner]),
                );
            },
        );

        p.push(Stage::new(PersistTask { tasks }).requires(&[owner]));

        p.before_each(|step, ctx: &FeedbackContext| {
            trace!(job = %ctx.job_name, step, "step starting");
        });

        Self {
            pipeline: p,
            conflict_retries: config.conflict_retries,
        }
    }

    /// Process one observation of the job called `name`.
    ///
    /// A write conflict means another delivery changed the task first; the
    /// whole handler re-runs against fresh state, up to the configured
    /// number of retries.
    #[tracing::instrument(name = "job_feedback", skip_all, fields(job = %name))]
    pub async fn handle(&self, name: &str) -> Result<Feedback, PipelineError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut ctx = FeedbackContext::new(name);
            match self.pipeline.run(&mut ctx).await {
                Ok(run) => {
                    return Ok(Feedback {
                        run,
                        kind: ctx.kind,
                        task_updated: ctx.updated,
                        attempts,
                    });
                }
                Err(e) if e.is_conflict() && attempts <= self.conflict_retries => {
                    debug!(attempts, "task changed concurrently, re-running feedback");
                }
                Err(e) => {
                    warn!(error = %e, attempts, "job feedback failed");
                    return Err(e);
                }
            }
        }
    }
}

struct FetchJob {
    jobs: Arc<dyn Api<BatchJob>>,
}

#[async_trait]
impl Step<FeedbackContext> for FetchJob {
    fn name(&self) -> &str {
        "fetch-job"
    }

    async fn run(&self, ctx: &mut FeedbackContext) -> Result<Flow> {
        match self.jobs.get(&ctx.job_name).await {
            Ok(job) => {
                ctx.job = Some(job);
                Ok(Flow::Continue)
            }
            Err(e) if e.is_not_found() => Ok(Flow::halt("job no longer exists")),
            Err(e) => Err(e),
        }
    }
}

/// Read the job type label. Jobs that carry neither our owner reference nor
/// our task-id label are not ours to handle and are skipped; on one of ours
/// a missing or unknown type is an error.
struct Classify {
    labels: LabelConfig,
}

impl Classify {
    fn is_ours(&self, job: &BatchJob) -> bool {
        job.metadata
            .owner
            .as_ref()
            .is_some_and(|o| o.kind == TranscodeTask::KIND)
            || job.metadata.label(&self.labels.task_id).is_some()
    }
}

#[async_trait]
impl Step<FeedbackContext> for Classify {
    fn name(&self) -> &str {
        "classify-job"
    }

    async fn run(&self, ctx: &mut FeedbackContext) -> Result<Flow> {
        let Some(job) = &ctx.job else {
            return Ok(Flow::halt("job not loaded"));
        };
        let ours = self.is_ours(job);
        let key = &self.labels.job_type;
        let Some(raw) = job.metadata.label(key) else {
            if ours {
                return Err(Error::MissingLabel {
                    job: job.metadata.name.clone(),
                    label: key.clone(),
                });
            }
            debug!("job has no type label, ignoring");
            return Ok(Flow::halt("no job type label"));
        };
        match raw.parse::<JobType>() {
            Ok(kind) => {
                ctx.kind = Some(kind);
                Ok(Flow::Continue)
            }
            Err(_) if ours => Err(Error::InvalidLabel {
                job: job.metadata.name.clone(),
                label: key.clone(),
                value: raw.to_string(),
            }),
            Err(e) => {
                debug!(error = %e, "ignoring job of unknown type");
                Ok(Flow::halt(e.to_string()))
            }
        }
    }
}

struct FetchOwner {
    tasks: Arc<dyn Api<TranscodeTask>>,
}

#[async_trait]
impl Step<FeedbackContext> for FetchOwner {
    fn name(&self) -> &str {
        "fetch-owner"
    }

    async fn run(&self, ctx: &mut FeedbackContext) -> Result<Flow> {
        let owner = ctx
            .job
            .as_ref()
            .and_then(|j| j.metadata.owner.as_ref())
            .filter(|o| o.kind == TranscodeTask::KIND);
        let Some(owner) = owner else {
            debug!("job has no owning task");
            return Ok(Flow::halt("no owning task"));
        };
        match self.tasks.get(&owner.name).await {
            Ok(task) => {
                ctx.before = Some(task.status.clone());
                ctx.task = Some(task);
                Ok(Flow::Continue)
            }
            Err(e) if e.is_not_found() => {
                debug!(task = %owner.name, "owning task is gone");
                Ok(Flow::halt("owning task no longer exists"))
            }
            Err(e) => Err(e),
        }
    }
}

fn owned_task<'a>(task: &'a mut Option<TranscodeTask>, job: &str) -> Result<&'a mut TranscodeTask> {
    task.as_mut()
        .ok_or_else(|| Error::Backend(format!("owning task of job '{job}' was not loaded")))
}

/// The count job normally follows from the orchestrator reacting to
/// `SplitComplete`; creating it here saves one round trip.
struct EnsureCountJob {
    jobs: Arc<dyn Api<BatchJob>>,
    factory: JobFactory,
}

#[async_trait]
impl Step<FeedbackContext> for EnsureCountJob {
    fn name(&self) -> &str {
        "ensure-count-job"
    }

    async fn run(&self, ctx: &mut FeedbackContext) -> Result<Flow> {
        let task = owned_task(&mut ctx.task, &ctx.job_name)?;
        ensure_job(self.jobs.as_ref(), self.factory.build(task, JobType::Count)).await?;
        Ok(Flow::Continue)
    }
}

struct SetCondition {
    name: String,
    kind: ConditionType,
    reason: &'static str,
    clock: Arc<dyn Clock>,
}

impl SetCondition {
    fn new(kind: ConditionType, reason: &'static str, clock: &Arc<dyn Clock>) -> Self {
        Self {
            name: format!("set-{kind}"),
            kind,
            reason,
            clock: clock.clone(),
        }
    }
}

#[async_trait]
impl Step<FeedbackContext> for SetCondition {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut FeedbackContext) -> Result<Flow> {
        let task = owned_task(&mut ctx.task, &ctx.job_name)?;
        let message = match self.kind {
            ConditionType::CountComplete => {
                format!("{} slices planned", task.status.slices_planned_count)
            }
            _ => String::new(),
        };
        let condition = Condition::new(self.kind, true, self.reason, message, self.clock.now());
        if task.status.conditions.set(condition) {
            info!(task = %task.metadata.name, condition = %self.kind, "condition set");
        }
        Ok(Flow::Continue)
    }
}

struct FinishSlice {
    labels: LabelConfig,
    clock: Arc<dyn Clock>,
}

impl FinishSlice {
    fn slice_index(&self, job: &BatchJob) -> Result<u32> {
        let key = &self.labels.slice_index;
        let raw = job.metadata.label(key).ok_or_else(|| Error::MissingLabel {
            job: job.metadata.name.clone(),
            label: key.clone(),
        })?;
        raw.parse().map_err(|_| Error::InvalidLabel {
            job: job.metadata.name.clone(),
            label: key.clone(),
            value: raw.to_string(),
        })
    }
}

#[async_trait]
impl Step<FeedbackContext> for FinishSlice {
    fn name(&self) -> &str {
        "finish-slice"
    }

    async fn run(&self, ctx: &mut FeedbackContext) -> Result<Flow> {
        let Some(job) = &ctx.job else {
            return Ok(Flow::halt("job not loaded"));
        };
        let index = self.slice_index(job)?;
        let task = owned_task(&mut ctx.task, &ctx.job_name)?;
        let status = &mut task.status;

        if status.finish_slice(index).is_none() {
            debug!(index, "slice was not scheduled, duplicate completion");
            return Ok(Flow::Continue);
        }
        info!(
            index,
            finished = status.slices_finished.len(),
            planned = status.slices_planned_count,
            "slice finished"
        );

        if status.all_slices_finished() {
            status.conditions.set(Condition::new(
                ConditionType::Progressing,
                false,
                "AllSlicesFinished",
                "",
                self.clock.now(),
            ));
        }
        Ok(Flow::Continue)
    }
}

struct PersistTask {
    tasks: Arc<dyn Api<TranscodeTask>>,
}

#[async_trait]
impl Step<FeedbackContext> for PersistTask {
    fn name(&self) -> &str {
        "persist-task"
    }

    async fn run(&self, ctx: &mut FeedbackContext) -> Result<Flow> {
        let task = owned_task(&mut ctx.task, &ctx.job_name)?;
        if ctx.before.as_ref() == Some(&task.status) {
            debug!("task status unchanged");
            return Ok(Flow::Continue);
        }
        *task = self.tasks.update(task.clone()).await?;
        ctx.updated = true;
        Ok(Flow::Continue)
    }
}
