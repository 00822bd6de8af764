//! Step and finalizer traits.

use async_trait::async_trait;

use super::errors::PipelineError;
use crate::error::Result;

/// What the pipeline does after a step returns successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Run the next step.
    Continue,
    /// Stop the run successfully; later steps are not executed.
    Halt(String),
}

impl Flow {
    pub fn halt(reason: impl Into<String>) -> Self {
        Self::Halt(reason.into())
    }
}

/// One named unit of work operating on the pipeline context.
///
/// # Example
///
/// ```ignore
/// struct FetchTask { tasks: Arc<dyn Api<TranscodeTask>> }
///
/// #[async_trait]
/// impl Step<TaskContext> for FetchTask {
///     fn name(&self) -> &str { "fetch-task" }
///
///     async fn run(&self, ctx: &mut TaskContext) -> Result<Flow> {
///         ctx.task = Some(self.tasks.get(&ctx.name).await?);
///         Ok(Flow::Continue)
///     }
/// }
/// ```
#[async_trait]
pub trait Step<C: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut C) -> Result<Flow>;
}

/// Runs exactly once after the pipeline stops, whatever the outcome.
///
/// Receives the terminal error (`None` on success or halt) and returns the
/// error the caller should see: pass it through, replace it, or suppress it
/// by returning `Ok(())`.
#[async_trait]
pub trait Finalizer<C: Send>: Send + Sync {
    async fn finalize(
        &self,
        ctx: &mut C,
        outcome: Option<PipelineError>,
    ) -> Result<(), PipelineError>;
}

/// Proof that a step was registered. Consumed by later registrations to
/// declare that they read what the earlier step wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepToken(pub(super) usize);

/// Step backed by a synchronous closure. Handy for pure context logic.
pub struct FnStep<F> {
    name: String,
    f: F,
}

pub fn from_fn<C, F>(name: impl Into<String>, f: F) -> FnStep<F>
where
    C: Send,
    F: Fn(&mut C) -> Result<Flow> + Send + Sync,
{
    FnStep {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<C, F> Step<C> for FnStep<F>
where
    C: Send,
    F: Fn(&mut C) -> Result<Flow> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut C) -> Result<Flow> {
        (self.f)(ctx)
    }
}
