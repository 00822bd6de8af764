//! Pipeline runner: sequential execution with predicates, nested groups,
//! declared dependencies, before-hooks and a finalizer.

use tracing::debug;

use super::errors::PipelineError;
use super::step::{Finalizer, Flow, Step, StepToken};

type Predicate<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;
type Hook<C> = Box<dyn Fn(&str, &C) + Send + Sync>;

/// A step plus its registration options.
pub struct Stage<C: Send> {
    step: Box<dyn Step<C>>,
    when: Option<Predicate<C>>,
    requires: Vec<StepToken>,
}

impl<C: Send + 'static> Stage<C> {
    pub fn new(step: impl Step<C> + 'static) -> Self {
        Self {
            step: Box::new(step),
            when: None,
            requires: Vec::new(),
        }
    }

    /// Skip the step when `predicate` is false at the moment it is reached.
    pub fn when(mut self, predicate: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.when = Some(Box::new(predicate));
        self
    }

    /// Assert that each of `tokens` executed earlier in the same run.
    pub fn requires(mut self, tokens: &[StepToken]) -> Self {
        self.requires.extend_from_slice(tokens);
        self
    }
}

enum Node<C: Send> {
    Step {
        id: usize,
        stage: Stage<C>,
    },
    Group {
        name: String,
        when: Predicate<C>,
        nodes: Vec<Node<C>>,
    },
}

/// Registers steps and groups at one nesting level.
pub struct Builder<'a, C: Send> {
    names: &'a mut Vec<String>,
    nodes: &'a mut Vec<Node<C>>,
}

impl<C: Send + 'static> Builder<'_, C> {
    pub fn push(&mut self, stage: Stage<C>) -> StepToken {
        let id = self.names.len();
        self.names.push(stage.step.name().to_string());
        self.nodes.push(Node::Step { id, stage });
        StepToken(id)
    }

    /// Register a group whose steps run only if `when` holds on entry.
    ///
    /// Whatever `build` returns (typically tokens) is handed back.
    pub fn group<T>(
        &mut self,
        name: impl Into<String>,
        when: impl Fn(&C) -> bool + Send + Sync + 'static,
        build: impl FnOnce(&mut Builder<'_, C>) -> T,
    ) -> T {
        let mut nodes = Vec::new();
        let out = {
            let mut inner = Builder {
                names: &mut *self.names,
                nodes: &mut nodes,
            };
            build(&mut inner)
        };
        self.nodes.push(Node::Group {
            name: name.into(),
            when: Box::new(when),
            nodes,
        });
        out
    }
}

/// Why a run stopped early without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    pub step: String,
    pub reason: String,
}

/// What happened during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Steps that ran, in order.
    pub executed: Vec<String>,
    /// Steps and groups whose predicate was false.
    pub skipped: Vec<String>,
    pub halted: Option<Halt>,
}

impl RunReport {
    pub fn ran(&self, step: &str) -> bool {
        self.executed.iter().any(|s| s == step)
    }
}

/// Ordered list of steps executed against one mutable context.
///
/// The pipeline itself holds no run state; build it once and run it for
/// every delivery.
pub struct Pipeline<C: Send> {
    name: String,
    names: Vec<String>,
    nodes: Vec<Node<C>>,
    hooks: Vec<Hook<C>>,
    finalizer: Option<Box<dyn Finalizer<C>>>,
}

impl<C: Send + 'static> Pipeline<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            names: Vec::new(),
            nodes: Vec::new(),
            hooks: Vec::new(),
            finalizer: None,
        }
    }

    fn builder(&mut self) -> Builder<'_, C> {
        Builder {
            names: &mut self.names,
            nodes: &mut self.nodes,
        }
    }

    pub fn push(&mut self, stage: Stage<C>) -> StepToken {
        self.builder().push(stage)
    }

    pub fn group<T>(
        &mut self,
        name: impl Into<String>,
        when: impl Fn(&C) -> bool + Send + Sync + 'static,
        build: impl FnOnce(&mut Builder<'_, C>) -> T,
    ) -> T {
        self.builder().group(name, when, build)
    }

    /// Observe every step right before it runs.
    pub fn before_each(&mut self, hook: impl Fn(&str, &C) + Send + Sync + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn finalize(&mut self, finalizer: impl Finalizer<C> + 'static) {
        self.finalizer = Some(Box::new(finalizer));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of all registered steps in registration order.
    pub fn step_names(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }

    /// Execute the pipeline against `ctx`.
    ///
    /// Steps run in order until one fails or halts. The finalizer then runs
    /// once with the terminal error and decides what the caller sees.
    ///
    /// # Panics
    ///
    /// If a step about to run requires a step that has not executed in this
    /// run. That is a wiring mistake, not a runtime condition.
    pub async fn run(&self, ctx: &mut C) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::default();
        let outcome = self.execute(ctx, &mut report).await;
        let outcome = match &self.finalizer {
            Some(finalizer) => finalizer.finalize(ctx, outcome.err()).await,
            None => outcome,
        };
        outcome.map(|()| report)
    }

    async fn execute(&self, ctx: &mut C, report: &mut RunReport) -> Result<(), PipelineError> {
        let mut executed = vec![false; self.names.len()];
        let mut stack = vec![self.nodes.iter()];

        while let Some(frame) = stack.last_mut() {
            let Some(node) = frame.next() else {
                stack.pop();
                continue;
            };

            match node {
                Node::Group { name, when, nodes } => {
                    if when(&*ctx) {
                        debug!(pipeline = %self.name, group = %name, "entering group");
                        stack.push(nodes.iter());
                    } else {
                        debug!(pipeline = %self.name, group = %name, "group skipped");
                        report.skipped.push(name.clone());
                    }
                }
                Node::Step { id, stage } => {
                    let step_name = stage.step.name();
                    if let Some(when) = &stage.when
                        && !when(&*ctx)
                    {
                        debug!(pipeline = %self.name, step = step_name, "step skipped");
                        report.skipped.push(step_name.to_string());
                        continue;
                    }

                    for token in &stage.requires {
                        self.assert_executed(step_name, *token, &executed);
                    }
                    for hook in &self.hooks {
                        hook(step_name, &*ctx);
                    }

                    debug!(pipeline = %self.name, step = step_name, "running step");
                    match stage.step.run(ctx).await {
                        Ok(Flow::Continue) => {
                            executed[*id] = true;
                            report.executed.push(step_name.to_string());
                        }
                        Ok(Flow::Halt(reason)) => {
                            executed[*id] = true;
                            report.executed.push(step_name.to_string());
                            debug!(pipeline = %self.name, step = step_name, %reason, "pipeline halted");
                            report.halted = Some(Halt {
                                step: step_name.to_string(),
                                reason,
                            });
                            return Ok(());
                        }
                        Err(source) => {
                            return Err(PipelineError::step_failed(&self.name, step_name, source));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn assert_executed(&self, step: &str, token: StepToken, executed: &[bool]) {
        let Some(required) = self.names.get(token.0) else {
            panic!(
                "pipeline '{}': step '{step}' requires a step registered in another pipeline",
                self.name
            );
        };
        if !executed[token.0] {
            panic!(
                "pipeline '{}': step '{step}' requires '{required}', which has not executed in this run",
                self.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::error::Error;
    use crate::pipeline::step::from_fn;

    #[derive(Default)]
    struct Trace {
        log: Vec<String>,
        gate: bool,
    }

    fn record(name: &'static str) -> Stage<Trace> {
        Stage::new(from_fn(name, move |ctx: &mut Trace| {
            ctx.log.push(name.to_string());
            Ok(Flow::Continue)
        }))
    }

    fn failing(name: &'static str) -> Stage<Trace> {
        Stage::new(from_fn(name, |_ctx: &mut Trace| {
            Err(Error::Backend("disk on fire".into()))
        }))
    }

    struct RecordingFinalizer {
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Option<String>>>,
        suppress: bool,
    }

    #[async_trait]
    impl Finalizer<Trace> for RecordingFinalizer {
        async fn finalize(
            &self,
            ctx: &mut Trace,
            outcome: Option<PipelineError>,
        ) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen.lock().unwrap() = outcome.as_ref().map(|e| e.to_string());
            ctx.log.push("finalize".into());
            match outcome {
                Some(_) if self.suppress => Ok(()),
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn finalizer(suppress: bool) -> (RecordingFinalizer, Arc<AtomicUsize>, Arc<Mutex<Option<String>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        (
            RecordingFinalizer {
                calls: calls.clone(),
                seen: seen.clone(),
                suppress,
            },
            calls,
            seen,
        )
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_skips_false_predicates() {
        let mut p = Pipeline::new("test");
        p.push(record("a"));
        p.push(record("b").when(|ctx: &Trace| ctx.gate));
        p.push(record("c"));

        let mut ctx = Trace::default();
        let report = p.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.log, vec!["a", "c"]);
        assert_eq!(report.executed, vec!["a", "c"]);
        assert_eq!(report.skipped, vec!["b"]);
        assert!(report.halted.is_none());
    }

    #[tokio::test]
    async fn predicates_see_changes_made_by_earlier_steps() {
        let mut p = Pipeline::new("test");
        p.push(Stage::new(from_fn("open", |ctx: &mut Trace| {
            ctx.gate = true;
            Ok(Flow::Continue)
        })));
        p.push(record("gated").when(|ctx: &Trace| ctx.gate));

        let mut ctx = Trace::default();
        p.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.log, vec!["gated"]);
    }

    #[tokio::test]
    async fn groups_gate_their_whole_subsequence() {
        let mut p = Pipeline::new("test");
        p.push(record("before"));
        p.group("closed", |ctx: &Trace| ctx.gate, |g| {
            g.push(record("x"));
            g.push(record("y"));
        });
        p.group("open", |_: &Trace| true, |g| {
            g.push(record("z"));
            g.group("nested", |_: &Trace| true, |g| {
                g.push(record("deep"));
            });
        });
        p.push(record("after"));

        let mut ctx = Trace::default();
        let report = p.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.log, vec!["before", "z", "deep", "after"]);
        assert_eq!(report.skipped, vec!["closed"]);
    }

    #[tokio::test]
    async fn group_predicate_is_evaluated_once_on_entry() {
        let mut p = Pipeline::new("test");
        p.group("once", |ctx: &Trace| !ctx.gate, |g| {
            g.push(Stage::new(from_fn("flip", |ctx: &mut Trace| {
                ctx.gate = true;
                Ok(Flow::Continue)
            })));
            g.push(record("still-runs"));
        });

        let mut ctx = Trace::default();
        p.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.log, vec!["still-runs"]);
    }

    #[tokio::test]
    async fn failure_aborts_and_is_wrapped_with_step_name() {
        let mut p = Pipeline::new("test");
        p.push(record("a"));
        p.push(failing("explode"));
        p.push(record("never"));

        let mut ctx = Trace::default();
        let err = p.run(&mut ctx).await.unwrap_err();

        assert_eq!(ctx.log, vec!["a"]);
        assert_eq!(err.step(), Some("explode"));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn halt_stops_the_run_successfully() {
        let mut p = Pipeline::new("test");
        p.push(Stage::new(from_fn("stop", |_ctx: &mut Trace| Ok(Flow::halt("nothing to do")))));
        p.push(record("never"));

        let mut ctx = Trace::default();
        let report = p.run(&mut ctx).await.unwrap();

        assert!(ctx.log.is_empty());
        assert_eq!(
            report.halted,
            Some(Halt {
                step: "stop".into(),
                reason: "nothing to do".into()
            })
        );
    }

    #[tokio::test]
    async fn finalizer_runs_once_on_success() {
        let (fin, calls, seen) = finalizer(false);
        let mut p = Pipeline::new("test");
        p.push(record("a"));
        p.finalize(fin);

        let mut ctx = Trace::default();
        p.run(&mut ctx).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().is_none());
        assert_eq!(ctx.log, vec!["a", "finalize"]);
    }

    #[tokio::test]
    async fn finalizer_runs_once_on_failure_and_sees_the_error() {
        let (fin, calls, seen) = finalizer(false);
        let mut p = Pipeline::new("test");
        p.push(failing("explode"));
        p.push(record("never"));
        p.finalize(fin);

        let mut ctx = Trace::default();
        let err = p.run(&mut ctx).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let seen = seen.lock().unwrap().clone().unwrap();
        assert!(seen.contains("explode"));
        assert_eq!(err.step(), Some("explode"));
    }

    #[tokio::test]
    async fn finalizer_can_suppress_the_terminal_error() {
        let (fin, calls, _) = finalizer(true);
        let mut p = Pipeline::new("test");
        p.push(failing("explode"));
        p.finalize(fin);

        let mut ctx = Trace::default();
        let report = p.run(&mut ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(report.executed.is_empty());
    }

    #[tokio::test]
    async fn satisfied_dependency_runs() {
        let mut p = Pipeline::new("test");
        let a = p.push(record("a"));
        p.push(record("b").requires(&[a]));

        let mut ctx = Trace::default();
        p.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.log, vec!["a", "b"]);
    }

    #[tokio::test]
    #[should_panic(expected = "requires 'load'")]
    async fn missing_dependency_panics_even_if_later_steps_would_succeed() {
        let mut p = Pipeline::new("test");
        let load = p.push(record("load").when(|ctx: &Trace| ctx.gate));
        p.push(record("use").requires(&[load]));
        p.push(record("fine"));

        let mut ctx = Trace::default();
        let _ = p.run(&mut ctx).await;
    }

    #[tokio::test]
    async fn hooks_observe_only_executed_steps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut p = Pipeline::new("test");
        p.push(record("a"));
        p.push(record("b").when(|_: &Trace| false));
        p.push(record("c"));
        let sink = seen.clone();
        p.before_each(move |name, ctx: &Trace| {
            sink.lock().unwrap().push(format!("{name}:{}", ctx.log.len()));
        });

        let mut ctx = Trace::default();
        p.run(&mut ctx).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a:0", "c:1"]);
    }

    #[test]
    fn step_names_follow_registration_order_across_groups() {
        let mut p: Pipeline<Trace> = Pipeline::new("test");
        p.push(record("a"));
        p.group("g", |_: &Trace| true, |g| {
            g.push(record("b"));
        });
        p.push(record("c"));
        assert_eq!(p.step_names(), vec!["a", "b", "c"]);
        assert_eq!(p.name(), "test");
    }
}
