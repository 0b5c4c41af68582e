use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use durable_core::config::DurableConfig;
use durable_jobs::purge::register_purge_job;
use durable_jobs::{
    AlertNotifier, Clock, DurableJobRunner, JobEnqueuer, JobRegistry, JobStore, JobWorker,
    LogNotifier, RecurringJobScheduler, SqliteJobStore, StartupJobScheduler, SystemClock,
};

mod relay;

/// Blocking threads kept free beyond `thread_pool_size` for timed-out jobs
/// that are still running.
const BLOCKING_HEADROOM: usize = 4;

/// Durable job worker: schedules and runs persisted jobs against one SQLite database.
#[derive(Parser)]
#[command(name = "durable-worker", version)]
struct Cli {
    /// Config file. Falls back to $DURABLE_CONFIG, then ./durable.toml.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run startup jobs, then schedule and run jobs until Ctrl-C (default).
    Run,
    /// One scheduling pass and one runner pass, then print the summary.
    RunOnce,
    /// Print every persisted job row as JSON.
    List,
    /// Queue a registered job to run on the next runner pass.
    Enqueue {
        /// Registered job name.
        name: String,
    },
}

struct Context {
    config: DurableConfig,
    registry: Arc<JobRegistry>,
    store: Arc<SqliteJobStore>,
    clock: Arc<dyn Clock>,
}

impl Context {
    fn open(config: DurableConfig) -> anyhow::Result<Self> {
        config.database.ensure_parent_dir()?;
        info!(path = %config.database.path, "opening SQLite database");
        let store = Arc::new(SqliteJobStore::open(&config.database.path)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut registry = JobRegistry::new();
        register_purge_job(&mut registry, store.clone(), clock.clone(), &config.jobs)?;
        info!(jobs = ?registry.names(), "job registry ready");

        Ok(Self {
            config,
            registry: Arc::new(registry),
            store,
            clock,
        })
    }

    fn worker(&self) -> JobWorker {
        let jobs = &self.config.jobs;
        let scheduler = RecurringJobScheduler::new(
            self.registry.clone(),
            self.store.clone(),
            self.clock.clone(),
            jobs,
        );
        let runner = DurableJobRunner::periodic(
            self.registry.clone(),
            self.store.clone(),
            self.clock.clone(),
            jobs,
        );
        JobWorker::new(scheduler, runner, jobs.poll_interval())
    }

    fn notifier(&self) -> anyhow::Result<Arc<dyn AlertNotifier>> {
        match self.config.alerts.relay_url() {
            Some(url) => {
                info!(url, "failure alerts go to the HTTP relay");
                Ok(Arc::new(relay::HttpRelayNotifier::new(url)?))
            }
            None => {
                warn!("no alerts.relay_url configured, failure alerts are only logged");
                Ok(Arc::new(LogNotifier))
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "durable_worker=info,durable_jobs=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // config: --config > DURABLE_CONFIG env > ./durable.toml
    let config_path = cli.config.or_else(|| std::env::var("DURABLE_CONFIG").ok());
    let config = DurableConfig::load(config_path.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.jobs.thread_pool_size.max(1) + BLOCKING_HEADROOM)
        .build()?;

    let ctx = Context::open(config)?;
    runtime.block_on(async move {
        match cli.command.unwrap_or(Command::Run) {
            Command::Run => run(ctx).await,
            Command::RunOnce => run_once(ctx).await,
            Command::List => list(&ctx),
            Command::Enqueue { name } => enqueue(&ctx, &name),
        }
    })
}

async fn run(ctx: Context) -> anyhow::Result<()> {
    // Startup pass: queue and run startup jobs before the recurring loop begins.
    let startup = StartupJobScheduler::new(
        ctx.registry.clone(),
        ctx.store.clone(),
        ctx.clock.clone(),
        &ctx.config.jobs,
    );
    let scheduled = startup.schedule_jobs()?;
    let runner = DurableJobRunner::startup(
        ctx.registry.clone(),
        ctx.store.clone(),
        ctx.clock.clone(),
        &ctx.config.jobs,
    )
    .with_alerts(ctx.config.alerts.clone(), ctx.notifier()?);
    let ran = runner.run_jobs().await?;
    info!(?scheduled, ?ran, "startup jobs complete");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {e}");
            return;
        }
        info!("Ctrl-C received, stopping after the current pass");
        let _ = shutdown_tx.send(true);
    });

    ctx.worker().run(shutdown_rx).await?;
    Ok(())
}

async fn run_once(ctx: Context) -> anyhow::Result<()> {
    let summary = ctx.worker().tick().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn list(ctx: &Context) -> anyhow::Result<()> {
    let jobs = ctx.store.list()?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

fn enqueue(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let enqueuer = JobEnqueuer::new(
        ctx.registry.clone(),
        ctx.store.clone(),
        ctx.clock.clone(),
        &ctx.config.jobs,
    );
    let outcome = enqueuer.enqueue(name)?;
    info!(job_name = name, ?outcome, "enqueue finished");
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}
