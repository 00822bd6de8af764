//! Step pipeline engine.
//!
//! Every control-flow decision of the orchestrator and the feedback handler
//! is a named step in a pipeline. The engine provides:
//!
//! - sequential execution against one mutable context
//! - per-step predicates and nested, predicate-gated groups
//! - typed dependency tokens that panic when a required step did not run
//! - before-hooks for tracing
//! - a finalizer that always runs and may rewrite the terminal error
//!
//! # Example
//!
//! ```ignore
//! let mut p = Pipeline::new("reconcile-task");
//! let fetched = p.push(Stage::new(FetchTask::new(tasks)));
//! p.group("slicing", |ctx: &TaskContext| ctx.is_slicing(), |g| {
//!     g.push(Stage::new(ScheduleSlices::new(jobs)).requires(&[fetched]));
//! });
//! p.finalize(RecordFailure::new(tasks, clock));
//!
//! let report = p.run(&mut ctx).await?;
//! ```

mod errors;
mod runner;
mod step;

pub use errors::PipelineError;
pub use runner::{Builder, Halt, Pipeline, RunReport, Stage};
pub use step::{FnStep, Finalizer, Flow, Step, StepToken, from_fn};
