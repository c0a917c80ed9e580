use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use procengine::{
    EngineConfig, ExecutionContext, InMemoryStore, Job, JobDefinition, JobHandler,
    JobHandlerRegistry, JobPopulation, ProcessEngine,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "procengine")]
#[command(about = "Command pipeline and lease-based job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers against one in-memory store until no due work remains
    Simulate {
        #[arg(long, default_value_t = 100)]
        jobs: usize,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long, default_value_t = 30_000)]
        lease_ms: u64,
        /// Every k-th execution fails (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: usize,
        #[arg(long, default_value_t = 3)]
        retries: u32,
        #[arg(long, default_value_t = 5)]
        scopes: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Print per-population counts of a snapshot
    Inspect {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Simulate {
            jobs,
            workers,
            lease_ms,
            fail_every,
            retries,
            scopes,
            config,
            snapshot,
            timeout_secs,
        } => {
            let settings = Simulation {
                jobs,
                workers,
                lease_ms,
                fail_every,
                retries,
                scopes: scopes.max(1),
                timeout: Duration::from_secs(timeout_secs),
            };
            simulate(settings, config.as_deref(), snapshot.as_deref()).await
        }
        Command::Inspect { snapshot } => inspect(&snapshot).await,
    }
}

struct Simulation {
    jobs: usize,
    workers: usize,
    lease_ms: u64,
    fail_every: usize,
    retries: u32,
    scopes: usize,
    timeout: Duration,
}

/// Handler that fails every `fail_every`-th call.
struct FlakyHandler {
    calls: AtomicUsize,
    fail_every: usize,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn handler_type(&self) -> &str {
        "simulated"
    }

    async fn execute(
        &self,
        job: &Job,
        _payload: Option<Vec<u8>>,
        _ctx: &mut ExecutionContext,
    ) -> procengine::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(procengine::EngineError::BusinessRuleViolation(format!(
                "simulated failure of job {} on call {}",
                job.id, call
            )));
        }
        Ok(())
    }
}

async fn simulate(settings: Simulation, config: Option<&Path>, snapshot: Option<&Path>) -> Result<()> {
    let mut config = match config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => EngineConfig::default(),
    };
    config.job_executor.worker_count = settings.workers.max(1);
    config.job_executor.lease_duration_ms = settings.lease_ms;
    config.job_executor.retry_wait_ms = 0;
    config.job_executor.idle_wait_ms = config.job_executor.idle_wait_ms.min(50);
    config.validate().context("Invalid configuration")?;

    let engine = ProcessEngine::builder().config(config).build();
    for scope in 0..settings.scopes {
        engine.create_scope(&format!("p{}", scope + 1)).await?;
    }
    for n in 0..settings.jobs {
        let scope = format!("p{}", n % settings.scopes + 1);
        engine
            .jobs()
            .schedule(
                JobDefinition::async_continuation("simulated")
                    .scope(&scope)
                    .retries(settings.retries),
            )
            .await?;
    }

    let handler = Arc::new(FlakyHandler {
        calls: AtomicUsize::new(0),
        fail_every: settings.fail_every,
    });
    let executor = Arc::new(engine.job_executor(JobHandlerRegistry::new().with_handler(handler.clone())));

    let started = Instant::now();
    executor.start().await?;
    loop {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if engine.jobs().count(JobPopulation::Executable).await? == 0 {
            break;
        }
        if started.elapsed() > settings.timeout {
            executor.stop().await?;
            return Err(anyhow!("Simulation did not finish within {:?}", settings.timeout));
        }
    }
    executor.stop().await?;

    let dead = engine.jobs().count(JobPopulation::DeadLetter).await?;
    println!("Scheduled:   {}", settings.jobs);
    println!("Completed:   {}", settings.jobs - dead);
    println!("Dead letter: {}", dead);
    println!("Executions:  {}", handler.calls.load(Ordering::SeqCst));
    println!("Commits:     {}", engine.store().commit_count());
    println!("Elapsed:     {:?}", started.elapsed());

    if let Some(path) = snapshot {
        let records = engine
            .save_snapshot(path)
            .await
            .with_context(|| format!("Failed to write snapshot '{}'", path.display()))?;
        println!("Snapshot:    {} ({} records)", path.display(), records);
    }
    Ok(())
}

async fn inspect(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("Snapshot '{}' does not exist", path.display()));
    }
    let store = InMemoryStore::load_snapshot(path)
        .await
        .with_context(|| format!("Failed to load snapshot '{}'", path.display()))?;

    println!("Snapshot: {}", path.display());
    for population in JobPopulation::ALL {
        println!("  {:<16} {}", population.kind(), store.count(population.kind()).await);
    }
    for kind in store.kinds().await {
        if JobPopulation::ALL.iter().any(|p| p.kind() == kind) {
            continue;
        }
        println!("  {:<16} {}", kind, store.count(&kind).await);
    }
    Ok(())
}
