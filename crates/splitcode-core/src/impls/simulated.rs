//! Simulated batch platform.
//!
//! Stands in for the cluster's job runner: a pending job runs for one poll
//! interval and is marked complete on the poll after it was first seen.
//! Count jobs first write the planned slice count onto their task, which is
//! what the real count program does before it exits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, LabelConfig};
use crate::domain::{BatchJob, JobCondition, JobType, LabelSelector, TranscodeTask};
use crate::error::{Error, Result};
use crate::ports::Api;

pub struct SimulatedBatchRunner {
    tasks: Arc<dyn Api<TranscodeTask>>,
    jobs: Arc<dyn Api<BatchJob>>,
    labels: LabelConfig,
    slices_per_task: u32,
    poll_interval: Duration,
    conflict_retries: u32,
    /// Jobs observed running on an earlier poll.
    running: Mutex<HashSet<String>>,
}

impl SimulatedBatchRunner {
    pub fn new(
        tasks: Arc<dyn Api<TranscodeTask>>,
        jobs: Arc<dyn Api<BatchJob>>,
        config: &ControllerConfig,
        slices_per_task: u32,
    ) -> Self {
        Self {
            tasks,
            jobs,
            labels: config.labels.clone(),
            slices_per_task,
            poll_interval: Duration::from_millis(20),
            conflict_retries: config.conflict_retries,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start newly seen jobs and complete the ones started on an earlier
    /// poll. Returns how many were completed.
    pub async fn tick(&self) -> Result<usize> {
        let pending: Vec<BatchJob> = self
            .jobs
            .list(&LabelSelector::everything())
            .await?
            .into_iter()
            .filter(|j| j.status.complete.is_none())
            .collect();

        let finishing: Vec<BatchJob> = {
            let mut running = self.running.lock().await;
            let (finishing, starting): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|j| running.contains(&j.metadata.name));
            for job in &starting {
                running.insert(job.metadata.name.clone());
            }
            finishing
        };

        let mut completed = 0;
        for job in finishing {
            let name = job.metadata.name.clone();
            match self.complete(job).await {
                Ok(()) => completed += 1,
                Err(e) if e.is_not_found() => {
                    // Reaped between polls; a recreated job starts over.
                    self.running.lock().await.remove(&name);
                    debug!(job = %name, error = %e, "job is gone");
                }
                // Changed under us; the next poll sees the new state.
                Err(e) if e.is_conflict() => {
                    debug!(job = %name, error = %e, "skipping job this round");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(completed)
    }

    async fn complete(&self, mut job: BatchJob) -> Result<()> {
        let kind = job
            .metadata
            .label(&self.labels.job_type)
            .and_then(|raw| raw.parse::<JobType>().ok());
        if kind == Some(JobType::Count) {
            self.write_plan(&job).await?;
        }

        job.status.complete = Some(true);
        job.status.conditions.push(JobCondition {
            kind: "Complete".into(),
            status: true,
            message: String::new(),
        });
        let name = job.metadata.name.clone();
        self.jobs.update(job).await?;
        self.running.lock().await.remove(&name);
        debug!(job = %name, "job completed");
        Ok(())
    }

    /// Record the slice count on the job's task, retrying on conflicts.
    async fn write_plan(&self, job: &BatchJob) -> Result<()> {
        let owner = job.metadata.owner.as_ref().ok_or_else(|| {
            Error::Backend(format!("count job '{}' has no owner", job.metadata.name))
        })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut task = self.tasks.get(&owner.name).await?;
            if task.status.slices_planned_count != 0 {
                return Ok(());
            }
            task.status.slices_planned_count = self.slices_per_task;
            match self.tasks.update(task).await {
                Ok(_) => {
                    info!(task = %owner.name, slices = self.slices_per_task, "counted slices");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempts <= self.conflict_retries => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll until `shutdown` flips.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "simulated runner poll failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::jobs::JobFactory;
    use crate::app::jobs::tests::sample_task;
    use crate::impls::InMemoryApi;

    #[tokio::test]
    async fn completes_pending_jobs_and_counts_slices() {
        let tasks = Arc::new(InMemoryApi::<TranscodeTask>::new());
        let jobs = Arc::new(InMemoryApi::<BatchJob>::new());
        let config = ControllerConfig::default();
        let factory = JobFactory::new(&config);

        let task = tasks.create(sample_task("movie", None)).await.unwrap();
        jobs.create(factory.build(&task, JobType::Split)).await.unwrap();
        jobs.create(factory.build(&task, JobType::Count)).await.unwrap();

        let runner = SimulatedBatchRunner::new(tasks.clone(), jobs.clone(), &config, 6);
        assert_eq!(runner.tick().await.unwrap(), 0);
        assert_eq!(tasks.get("movie").await.unwrap().status.slices_planned_count, 0);
        assert_eq!(runner.tick().await.unwrap(), 2);
        assert_eq!(runner.tick().await.unwrap(), 0);

        let all = jobs.list(&LabelSelector::everything()).await.unwrap();
        assert!(all.iter().all(BatchJob::is_complete));
        assert_eq!(tasks.get("movie").await.unwrap().status.slices_planned_count, 6);
    }

    #[tokio::test]
    async fn job_whose_completion_hits_not_found_is_forgotten() {
        let tasks = Arc::new(InMemoryApi::<TranscodeTask>::new());
        let jobs = Arc::new(InMemoryApi::<BatchJob>::new());
        let config = ControllerConfig::default();
        let factory = JobFactory::new(&config);

        let task = tasks.create(sample_task("movie", None)).await.unwrap();
        let job = jobs.create(factory.build(&task, JobType::Count)).await.unwrap();
        let runner = SimulatedBatchRunner::new(tasks.clone(), jobs.clone(), &config, 3);
        runner.tick().await.unwrap();
        assert!(runner.running.lock().await.contains(&job.metadata.name));

        tasks.delete("movie").await.unwrap();
        assert_eq!(runner.tick().await.unwrap(), 0);
        assert!(runner.running.lock().await.is_empty());
    }

    #[tokio::test]
    async fn plan_write_survives_a_conflict() {
        let tasks = Arc::new(InMemoryApi::<TranscodeTask>::new());
        let jobs = Arc::new(InMemoryApi::<BatchJob>::new());
        let config = ControllerConfig::default();
        let factory = JobFactory::new(&config);

        let task = tasks.create(sample_task("movie", None)).await.unwrap();
        jobs.create(factory.build(&task, JobType::Count)).await.unwrap();
        tasks.inject_conflicts(1).await;

        let runner = SimulatedBatchRunner::new(tasks.clone(), jobs.clone(), &config, 2);
        runner.tick().await.unwrap();
        assert_eq!(runner.tick().await.unwrap(), 1);
        assert_eq!(tasks.get("movie").await.unwrap().status.slices_planned_count, 2);
    }
}
