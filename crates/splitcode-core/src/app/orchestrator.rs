//! Task orchestrator: the phase state machine for one task.
//!
//! Every pass starts from the persisted task and walks the whole phase
//! table. Phases whose entry predicate does not hold are skipped, so the
//! same pipeline handles a fresh task, a task mid-slicing after a restart
//! and a finished task waiting to be reaped.
//!
//! ```text
//! fetch-task
//! [reap]      Ready                      -> delete every job of the task, halt
//! [split]     planned == 0, !CountDone   -> ensure split job
//! [count]     SplitDone, !CountDone      -> ensure count job
//! check-plan  CountDone, planned == 0    -> invalid task
//! [slicing]   finished < planned         -> schedule slices up to the cap
//! settle      all finished               -> Progressing = false
//! [merge]     Progressing == false       -> ensure merge job
//! [cleanup]   MergeComplete              -> ensure cleanup job
//! update-status                          -> one CAS write if anything changed
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use super::jobs::{JobFactory, ensure_job};
use crate::config::ControllerConfig;
use crate::domain::{
    BatchJob, Condition, ConditionType, JobType, Phase, SliceRef, TaskStatus, TranscodeTask,
};
use crate::error::{Error, Result};
use crate::pipeline::{Finalizer, Flow, Pipeline, PipelineError, RunReport, Stage, Step, from_fn};
use crate::ports::{Api, Clock};

/// Working state of one reconciliation pass.
#[derive(Debug)]
pub struct TaskContext {
    pub name: String,
    /// Loaded by `fetch-task`; `None` means the task is gone.
    pub task: Option<TranscodeTask>,
    /// Status as read, to decide whether a write is needed.
    before: Option<TaskStatus>,
    pub created_jobs: Vec<String>,
    pub reaped_jobs: usize,
}

impl TaskContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task: None,
            before: None,
            created_jobs: Vec::new(),
            reaped_jobs: 0,
        }
    }

    fn status(&self) -> Option<&TaskStatus> {
        self.task.as_ref().map(|t| &t.status)
    }

    fn holds(&self, predicate: impl FnOnce(&TaskStatus) -> bool) -> bool {
        self.status().is_some_and(predicate)
    }
}

fn loaded<'a>(task: &'a mut Option<TranscodeTask>, name: &str) -> Result<&'a mut TranscodeTask> {
    task.as_mut()
        .ok_or_else(|| Error::invalid_task(name, "task was not loaded"))
}

/// Outcome of one pass, for logging and tests.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub run: RunReport,
    pub phase: Option<Phase>,
    pub created_jobs: Vec<String>,
    pub reaped_jobs: usize,
}

pub struct TaskOrchestrator {
    pipeline: Pipeline<TaskContext>,
}

impl TaskOrchestrator {
    pub fn new(
        tasks: Arc<dyn Api<TranscodeTask>>,
        jobs: Arc<dyn Api<BatchJob>>,
        config: &ControllerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let factory = Arc::new(JobFactory::new(config));
        let mut p = Pipeline::new("reconcile-task");

        let fetched = p.push(Stage::new(FetchTask {
            tasks: tasks.clone(),
        }));

        p.group(
            "reap",
            |ctx: &TaskContext| ctx.holds(|s| s.is_true(ConditionType::Ready)),
            |g| {
                g.push(
                    Stage::new(ReapJobs {
                        jobs: jobs.clone(),
                        factory: factory.clone(),
                    })
                    .requires(&[fetched]),
                );
            },
        );

        p.group(
            "split",
            |ctx: &TaskContext| {
                ctx.holds(|s| {
                    s.slices_planned_count == 0 && !s.is_true(ConditionType::CountComplete)
                })
            },
            |g| {
                g.push(Stage::new(EnsureJob::new(JobType::Split, &jobs, &factory)).requires(&[fetched]));
            },
        );

        p.group(
            "count",
            |ctx: &TaskContext| {
                ctx.holds(|s| {
                    s.is_true(ConditionType::SplitComplete)
                        && !s.is_true(ConditionType::CountComplete)
                })
            },
            |g| {
                g.push(Stage::new(EnsureJob::new(JobType::Count, &jobs, &factory)).requires(&[fetched]));
            },
        );

        p.push(
            Stage::new(from_fn("check-plan", |ctx: &mut TaskContext| {
                Err(Error::invalid_task(
                    &ctx.name,
                    "count completed but no slices were planned",
                ))
            }))
            .when(|ctx: &TaskContext| {
                ctx.holds(|s| {
                    s.is_true(ConditionType::CountComplete) && s.slices_planned_count == 0
                })
            }),
        );

        p.group(
            "slicing",
            |ctx: &TaskContext| {
                ctx.holds(|s| {
                    s.slices_planned_count > 0
                        && s.slices_finished.len() < s.slices_planned_count as usize
                })
            },
            |g| {
                let checked = g.push(
                    Stage::new(from_fn("check-concurrency", |ctx: &mut TaskContext| {
                        let task = loaded(&mut ctx.task, &ctx.name)?;
                        if task.concurrency_cap() == Some(0) {
                            return Err(Error::invalid_task(
                                &ctx.name,
                                "concurrency cap of 0 would never schedule a slice",
                            ));
                        }
                        Ok(Flow::Continue)
                    }))
                    .requires(&[fetched]),
                );
                g.push(
                    Stage::new(ScheduleSlices {
                        jobs: jobs.clone(),
                        factory: factory.clone(),
                        clock: clock.clone(),
                    })
                    .requires(&[fetched, checked]),
                );
            },
        );

        let settle_clock = clock.clone();
        p.push(
            Stage::new(from_fn("settle-progress", move |ctx: &mut TaskContext| {
                let task = loaded(&mut ctx.task, &ctx.name)?;
                let changed = task.status.conditions.set(Condition::new(
                    ConditionType::Progressing,
                    false,
                    "AllSlicesFinished",
                    "",
                    settle_clock.now(),
                ));
                if changed {
                    info!(task = %ctx.name, "all slices finished, settling progress");
                }
                Ok(Flow::Continue)
            }))
            .when(|ctx: &TaskContext| {
                ctx.holds(|s| s.all_slices_finished() && !s.is_false(ConditionType::Progressing))
            })
            .requires(&[fetched]),
        );

        p.group(
            "merge",
            |ctx: &TaskContext| ctx.holds(|s| s.is_false(ConditionType::Progressing)),
            |g| {
                g.push(Stage::new(EnsureJob::new(JobType::Merge, &jobs, &factory)).requires(&[fetched]));
            },
        );

        p.group(
            "cleanup",
            |ctx: &TaskContext| ctx.holds(|s| s.is_true(ConditionType::MergeComplete)),
            |g| {
                g.push(
                    Stage::new(EnsureJob::new(JobType::Cleanup, &jobs, &factory))
                        .requires(&[fetched]),
                );
            },
        );

        p.push(
            Stage::new(UpdateStatus {
                tasks: tasks.clone(),
            })
            .requires(&[fetched]),
        );

        p.before_each(|step, ctx: &TaskContext| {
            trace!(task = %ctx.name, step, "step starting");
        });
        p.finalize(RecordFailure { tasks, clock });

        Self { pipeline: p }
    }

    /// Run one reconciliation pass for the task called `name`.
    #[tracing::instrument(name = "reconcile_task", skip_all, fields(task = %name))]
    pub async fn reconcile(&self, name: &str) -> Result<Reconciled, PipelineError> {
        let mut ctx = TaskContext::new(name);
        let run = self.pipeline.run(&mut ctx).await?;
        Ok(Reconciled {
            phase: ctx.status().map(Phase::of),
            run,
            created_jobs: ctx.created_jobs,
            reaped_jobs: ctx.reaped_jobs,
        })
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.pipeline.step_names()
    }
}

struct FetchTask {
    tasks: Arc<dyn Api<TranscodeTask>>,
}

#[async_trait]
impl Step<TaskContext> for FetchTask {
    fn name(&self) -> &str {
        "fetch-task"
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<Flow> {
        match self.tasks.get(&ctx.name).await {
            Ok(task) => {
                debug!(phase = %Phase::of(&task.status), "task loaded");
                ctx.before = Some(task.status.clone());
                ctx.task = Some(task);
                Ok(Flow::Continue)
            }
            Err(e) if e.is_not_found() => Ok(Flow::halt("task no longer exists")),
            Err(e) => Err(e),
        }
    }
}

/// Done phase: the store has no cascade delete, so remove the jobs here.
struct ReapJobs {
    jobs: Arc<dyn Api<BatchJob>>,
    factory: Arc<JobFactory>,
}

#[async_trait]
impl Step<TaskContext> for ReapJobs {
    fn name(&self) -> &str {
        "reap-jobs"
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<Flow> {
        let task = loaded(&mut ctx.task, &ctx.name)?;
        let selector = self.factory.task_selector(task.task_id());
        let deleted = self.jobs.delete_all(&selector).await?;
        if deleted > 0 {
            info!(deleted, "task ready, reaped its jobs");
        }
        ctx.reaped_jobs = deleted;
        Ok(Flow::halt("task is ready"))
    }
}

struct EnsureJob {
    name: String,
    kind: JobType,
    jobs: Arc<dyn Api<BatchJob>>,
    factory: Arc<JobFactory>,
}

impl EnsureJob {
    fn new(kind: JobType, jobs: &Arc<dyn Api<BatchJob>>, factory: &Arc<JobFactory>) -> Self {
        Self {
            name: format!("ensure-{kind}-job"),
            kind,
            jobs: jobs.clone(),
            factory: factory.clone(),
        }
    }
}

#[async_trait]
impl Step<TaskContext> for EnsureJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<Flow> {
        let task = loaded(&mut ctx.task, &ctx.name)?;
        let job = self.factory.build(task, self.kind);
        let job_name = job.metadata.name.clone();
        if ensure_job(self.jobs.as_ref(), job).await? {
            ctx.created_jobs.push(job_name);
        }
        Ok(Flow::Continue)
    }
}

/// Fill the concurrency cap with slice jobs, lowest free index first.
struct ScheduleSlices {
    jobs: Arc<dyn Api<BatchJob>>,
    factory: Arc<JobFactory>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl Step<TaskContext> for ScheduleSlices {
    fn name(&self) -> &str {
        "schedule-slices"
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<Flow> {
        let task = loaded(&mut ctx.task, &ctx.name)?;
        let cap = task.concurrency_cap();
        let mut scheduled = 0usize;

        while let Some(index) = task.status.next_slice_index(cap) {
            let job = self.factory.slice(task, index);
            let job_name = job.metadata.name.clone();
            if ensure_job(self.jobs.as_ref(), job).await? {
                ctx.created_jobs.push(job_name.clone());
            }
            task.status.schedule_slice(SliceRef::new(job_name, index));
            scheduled += 1;
        }

        if scheduled > 0 {
            info!(
                scheduled,
                running = task.status.slices_scheduled.len(),
                finished = task.status.slices_finished.len(),
                planned = task.status.slices_planned_count,
                "scheduled slices"
            );
            task.status.conditions.set(Condition::new(
                ConditionType::Progressing,
                true,
                "SlicesScheduled",
                format!(
                    "{} of {} slices finished",
                    task.status.slices_finished.len(),
                    task.status.slices_planned_count
                ),
                self.clock.now(),
            ));
        }
        Ok(Flow::Continue)
    }
}

struct UpdateStatus {
    tasks: Arc<dyn Api<TranscodeTask>>,
}

#[async_trait]
impl Step<TaskContext> for UpdateStatus {
    fn name(&self) -> &str {
        "update-status"
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<Flow> {
        let task = loaded(&mut ctx.task, &ctx.name)?;
        if ctx.before.as_ref() == Some(&task.status) {
            debug!("status unchanged");
            return Ok(Flow::Continue);
        }

        let updated = self.tasks.update(task.clone()).await?;
        let from = ctx.before.as_ref().map(Phase::of);
        let to = Phase::of(&updated.status);
        if from != Some(to) {
            info!(phase = %to, "phase changed");
        }
        ctx.before = Some(updated.status.clone());
        *task = updated;
        Ok(Flow::Continue)
    }
}

/// Records the pass outcome on the task as the `Failed` condition.
///
/// Conflicts and not-found say nothing about the task and are only passed
/// back for retry. Anything else is written onto a freshly read copy of the
/// task so the failure is visible without logs. A clean pass removes a
/// previously recorded failure.
struct RecordFailure {
    tasks: Arc<dyn Api<TranscodeTask>>,
    clock: Arc<dyn Clock>,
}

impl RecordFailure {
    async fn clear(&self, ctx: &mut TaskContext) -> Result<()> {
        let Some(task) = ctx.task.as_mut() else {
            return Ok(());
        };
        if !task.status.conditions.remove(ConditionType::Failed) {
            return Ok(());
        }
        *task = self.tasks.update(task.clone()).await?;
        info!("cleared previous failure");
        Ok(())
    }

    async fn record(&self, name: &str, error: &PipelineError) -> Result<()> {
        let mut task = self.tasks.get(name).await?;
        let changed = task.status.conditions.set(Condition::new(
            ConditionType::Failed,
            true,
            "ReconcileError",
            error.to_string(),
            self.clock.now(),
        ));
        if changed {
            self.tasks.update(task).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Finalizer<TaskContext> for RecordFailure {
    async fn finalize(
        &self,
        ctx: &mut TaskContext,
        outcome: Option<PipelineError>,
    ) -> Result<(), PipelineError> {
        let Some(error) = outcome else {
            return self
                .clear(ctx)
                .await
                .map_err(|e| PipelineError::finalize_failed("reconcile-task", e));
        };

        let cause = error.cause();
        if cause.is_conflict() || cause.is_not_found() {
            debug!(%error, "transient failure, will retry");
            return Err(error);
        }

        warn!(%error, "reconcile pass failed");
        if let Err(e) = self.record(&ctx.name, &error).await {
            warn!(error = %e, "could not record failure on task");
        }
        Err(error)
    }
}
