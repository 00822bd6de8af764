use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use splitcode_core::ControllerConfig;
use splitcode_core::app::{Controller, JobFactory};
use splitcode_core::domain::{
    BatchJob, CleanupSpec, ConcurrencyStrategy, ConditionType, EncodeSpec, MediaUrl, StorageSpec,
    TaskSpec, TranscodeTask,
};
use splitcode_core::impls::{InMemoryApi, SimulatedBatchRunner};
use splitcode_core::observability::TaskProgress;
use splitcode_core::ports::{Api, Clock, IdGenerator, SystemClock, UlidGenerator};

#[derive(Debug, Parser)]
#[command(name = "splitcode", version, about = "Slice-parallel transcoding orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one task end to end against an in-memory store and a simulated
    /// batch platform, then print its final progress.
    Demo {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Slices the simulated count job reports.
        #[arg(long, default_value_t = 8)]
        slices: u32,

        /// Cap on concurrently running slice jobs.
        #[arg(long)]
        max_concurrency: Option<u32>,

        #[arg(long, default_value = "/mnt/media/in/movie.mkv")]
        source: String,

        #[arg(long, default_value = "/mnt/media/out/movie.mp4")]
        target: String,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Print the effective configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ControllerConfig> {
    match path {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ControllerConfig::default()),
    }
}

fn media_url(raw: &str) -> MediaUrl {
    match raw.rsplit_once('/') {
        Some((root, path)) => MediaUrl::new(root, path),
        None => MediaUrl::new("", raw),
    }
}

struct DemoArgs {
    config: ControllerConfig,
    slices: u32,
    max_concurrency: Option<u32>,
    source: String,
    target: String,
    timeout: Duration,
}

async fn demo(args: DemoArgs) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tasks = Arc::new(InMemoryApi::<TranscodeTask>::with_clock(clock.clone()));
    let jobs = Arc::new(InMemoryApi::<BatchJob>::with_clock(clock.clone()));

    let controller = Controller::new(tasks.clone(), jobs.clone(), args.config.clone(), clock)
        .context("starting controller")?;
    let handle = controller.start();

    let (runner_tx, runner_rx) = watch::channel(false);
    let runner = SimulatedBatchRunner::new(tasks.clone(), jobs.clone(), &args.config, args.slices)
        .spawn(runner_rx);

    let task_id = UlidGenerator::new(SystemClock).generate_task_id();
    let source = media_url(&args.source);
    let name = source
        .path
        .rsplit_once('.')
        .map_or(source.path.as_str(), |(stem, _)| stem)
        .to_lowercase();
    let task = TranscodeTask::new(
        name.clone(),
        TaskSpec {
            task_id,
            storage: StorageSpec {
                volume: "media".into(),
                mount_path: source.root.clone(),
            },
            source,
            target: media_url(&args.target),
            encode: EncodeSpec::default(),
            cleanup: CleanupSpec::default(),
            concurrency: args
                .max_concurrency
                .map(|max_count| ConcurrencyStrategy { max_count }),
        },
    );
    tasks.create(task).await.context("submitting task")?;
    info!(task = %name, %task_id, "task submitted");

    let selector = JobFactory::new(&args.config).task_selector(task_id);
    let deadline = Instant::now() + args.timeout;
    let (task, finished) = loop {
        let task = tasks.get(&name).await?;
        let remaining = jobs.list(&selector).await?.len();
        if task.status.is_true(ConditionType::Ready) && remaining == 0 {
            break (task, true);
        }
        if Instant::now() >= deadline {
            break (task, false);
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(50)) => {}
            _ = tokio::signal::ctrl_c() => break (task, false),
        }
    };

    let _ = runner_tx.send(true);
    if let Err(e) = runner.await {
        warn!(error = %e, "simulated runner ended abnormally");
    }
    handle.shutdown_and_join().await;

    println!("{}", serde_json::to_string_pretty(&TaskProgress::from(&task))?);
    if !finished {
        bail!("task '{name}' did not finish");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            config,
            slices,
            max_concurrency,
            source,
            target,
            timeout_secs,
        } => {
            demo(DemoArgs {
                config: load_config(config.as_ref())?,
                slices,
                max_concurrency,
                source,
                target,
                timeout: Duration::from_secs(timeout_secs),
            })
            .await
        }
        Command::Config { config } => {
            let config = load_config(config.as_ref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
