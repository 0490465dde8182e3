use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use db_shootout::config::{ExperimentConfig, ReadinessPolicy};
use db_shootout::environment::runtime::{ContainerRuntime, PodmanRuntime};
use db_shootout::load::{
    AggregateOutcome, DriverFactory, HttpDriverFactory, InProcessDriverFactory, LoadCoordinator, LoadPlan,
    SessionConfig, StopHandle,
};
use db_shootout::orchestrator::ExperimentOrchestrator;
use db_shootout::query::driver::{SqlDriver, SqlxDriver};
use db_shootout::selector::{LocalSplitSelector, QUERY_EXECUTION_METRIC};
use db_shootout::shutdown::{shutdown_signal, ShutdownHooks, ShutdownTrigger};
use db_shootout::simulated::{MemoryDriver, MemoryRuntime};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "db-shootout", version, about = "PostgreSQL vs MariaDB query latency harness")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the aggregate outcome as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a running comparison endpoint with concurrent HTTP sessions
    Load(LoadArgs),
    /// Provision both backends in-process and drive the orchestrator directly
    Bench(BenchArgs),
    /// Stop and remove the experiment containers
    Cleanup,
}

#[derive(Args)]
struct SessionArgs {
    /// Number of concurrent sessions
    #[arg(long, default_value_t = 5)]
    sessions: usize,

    /// Duration of each session in seconds
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Seconds between manual refreshes
    #[arg(long, default_value_t = 5)]
    refresh_interval: u64,

    /// Use the page's auto-refresh instead of manual refreshes
    #[arg(long, conflicts_with = "refresh_interval")]
    auto_refresh: bool,

    /// Queries distributed round-robin across sessions
    #[arg(long, num_args = 1..)]
    queries: Vec<String>,
}

impl SessionArgs {
    fn plan(&self) -> LoadPlan {
        let duration = Duration::from_secs(self.duration);
        let session = if self.auto_refresh {
            SessionConfig::auto(duration)
        } else {
            SessionConfig::manual(duration, Duration::from_secs(self.refresh_interval))
        };
        LoadPlan::new(self.sessions, session).with_queries(self.queries.clone())
    }
}

#[derive(Args)]
struct LoadArgs {
    /// Base URL of the comparison endpoint
    #[arg(long, default_value = "http://localhost:5000")]
    url: String,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct BenchArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Rows seeded into each backend (overrides SHOOTOUT_ROW_COUNT)
    #[arg(long)]
    rows: Option<usize>,

    /// Use in-memory backends instead of containers
    #[arg(long)]
    simulate: bool,

    /// Abort dispatched queries after this many milliseconds
    #[arg(long)]
    statement_timeout_ms: Option<u64>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "db_shootout=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Load(args) => load(args, cli.json).await,
        Command::Bench(args) => bench(args, cli.json).await,
        Command::Cleanup => cleanup().await,
    }
}

async fn load(args: LoadArgs, json: bool) -> Result<ExitCode> {
    let plan = args.session.plan();
    tracing::info!(
        url = %args.url,
        sessions = plan.sessions,
        duration_s = args.session.duration,
        auto_refresh = args.session.auto_refresh,
        "starting load test"
    );

    let factory: Arc<dyn DriverFactory> = Arc::new(HttpDriverFactory::new(&args.url)?);
    let coordinator = LoadCoordinator::new(plan, factory)?;
    let signal = stop_on_signal(coordinator.stop_handle());

    let outcome = coordinator.run().await;
    signal.abort();
    report(&outcome, json)?;
    Ok(exit_code(&outcome))
}

async fn bench(args: BenchArgs, json: bool) -> Result<ExitCode> {
    let mut config = ExperimentConfig::from_env()?;
    if let Some(rows) = args.rows {
        config = config.with_row_count(rows);
    }
    if let Some(ms) = args.statement_timeout_ms {
        config = config.with_statement_timeout(Duration::from_millis(ms));
    }

    let (runtime, driver): (Arc<dyn ContainerRuntime>, Arc<dyn SqlDriver>) = if args.simulate {
        config = config.with_readiness(ReadinessPolicy {
            attempts: 1,
            interval: Duration::ZERO,
        });
        (Arc::new(MemoryRuntime::new()), Arc::new(MemoryDriver::new()))
    } else {
        (
            Arc::new(PodmanRuntime::new(config.container_runtime.clone())),
            Arc::new(SqlxDriver::default()),
        )
    };

    let selector = Arc::new(LocalSplitSelector::default());
    let orchestrator = Arc::new(ExperimentOrchestrator::new(config, runtime, driver, selector.clone()));
    let factory: Arc<dyn DriverFactory> = Arc::new(InProcessDriverFactory::new(Arc::clone(&orchestrator)));
    let coordinator = LoadCoordinator::new(args.session.plan(), factory)?;

    let hooks = ShutdownHooks::new(Arc::clone(&orchestrator));
    hooks.stop_sessions(coordinator.stop_handle());
    let mut shutdown_events = hooks.subscribe();
    let signal_listener = hooks.spawn_signal_listener();

    if let Err(err) = orchestrator.ensure_ready().await {
        hooks.trigger(ShutdownTrigger::Exit).await;
        signal_listener.abort();
        return Err(err).context("failed to prepare backends");
    }

    let outcome = coordinator.run().await;
    if let Ok(trigger) = shutdown_events.try_recv() {
        tracing::warn!(%trigger, "run interrupted");
    }
    hooks.trigger(ShutdownTrigger::Exit).await;
    signal_listener.abort();

    report(&outcome, json)?;
    for (database, summary) in selector.summary(QUERY_EXECUTION_METRIC) {
        println!(
            "{database:>10}: {} queries, mean {:.3} ms",
            summary.count,
            summary.mean * 1000.0
        );
    }
    Ok(exit_code(&outcome))
}

async fn cleanup() -> Result<ExitCode> {
    let config = ExperimentConfig::from_env()?;
    let names = [config.postgres.container_name.clone(), config.mariadb.container_name.clone()];
    let orchestrator = ExperimentOrchestrator::with_podman(config);
    orchestrator.shutdown().await;
    println!("cleaned up containers: {}", names.join(", "));
    Ok(ExitCode::SUCCESS)
}

fn stop_on_signal(stop: StopHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.stop_all();
    })
}

fn report(outcome: &AggregateOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    println!(
        "sessions: {} completed, {} cancelled, {} failed ({} page loads in {:.1}s)",
        outcome.completed,
        outcome.cancelled,
        outcome.failed,
        outcome.triggers(),
        outcome.elapsed.as_secs_f64()
    );
    for failed in outcome.reports.iter().filter(|r| r.error.is_some()) {
        println!("  {}: {}", failed.id, failed.error.as_deref().unwrap_or_default());
    }
    Ok(())
}

fn exit_code(outcome: &AggregateOutcome) -> ExitCode {
    if outcome.all_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
