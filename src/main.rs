use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use taskpool::{
    LockMode, LockOptions, LoggingEventHandler, PoolConfig, Priority, Scheduler, TaskError,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "taskpool")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a demonstration workload on a cooperative worker pool")]
struct Args {
    /// Pool configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of independent tasks submitted per priority
    #[arg(short, long, default_value_t = 8)]
    tasks: usize,

    /// Override the minimum pool size
    #[arg(long)]
    min_workers: Option<usize>,

    /// Override the maximum pool size
    #[arg(long)]
    max_workers: Option<usize>,

    /// Log every task event
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let mut config = match &self.config {
            Some(path) => PoolConfig::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PoolConfig::default(),
        };
        if let Some(min) = self.min_workers {
            config.min_workers = min;
        }
        if let Some(max) = self.max_workers {
            config.max_workers = max;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("taskpool=info")),
        )
        .init();

    let args = Args::parse();
    let config = args.pool_config()?;
    info!(
        "Starting demo with {} tasks per priority on {}..={} workers",
        args.tasks, config.min_workers, config.max_workers
    );

    let scheduler = Scheduler::new(config)?;
    if args.verbose {
        scheduler.add_event_handler(Box::new(LoggingEventHandler));
    }

    run_priorities(&scheduler, args.tasks).await?;
    run_dependency_chain(&scheduler).await?;
    run_group(&scheduler).await?;
    run_sequence(&scheduler).await?;
    run_contended_lock(&scheduler).await?;

    let info = scheduler.info();
    println!("{}", serde_json::to_string_pretty(&info)?);
    scheduler.shutdown();
    Ok(())
}

async fn run_priorities(scheduler: &Scheduler, per_priority: usize) -> anyhow::Result<()> {
    let mut handles = Vec::new();
    for priority in Priority::ALL {
        for i in 0..per_priority {
            let handle = scheduler.submit(
                move |ctx| {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(json!({ "task": ctx.task_id().as_u64(), "index": i }))
                },
                priority,
                &[],
            )?;
            handles.push(handle);
        }
    }
    let total = handles.len();
    for handle in handles {
        handle.await?;
    }
    info!("Completed {} prioritized tasks", total);
    Ok(())
}

async fn run_dependency_chain(scheduler: &Scheduler) -> anyhow::Result<()> {
    let fetch = scheduler.create_task("fetch", |_| Ok(json!(20)));
    let parse = scheduler.create_task("parse", |_| Ok(json!(21)));
    scheduler.add_dependency(parse.id(), fetch.id())?;

    let parsed = scheduler.execute(&parse, Priority::High)?;
    let fetched = scheduler.execute(&fetch, Priority::Low)?;
    let report = scheduler.submit(|_| Ok(json!(42)), Priority::Medium, &[parse.id()])?;

    fetched.await?;
    parsed.await?;
    let value = report.await?;
    info!("Dependency chain finished with {}", value);

    // A cancelled dependency rejects everything downstream
    let never = scheduler.create_task("never", |_| Ok(json!(null)));
    let gate = scheduler.create_task("gate", |_| Ok(json!(null)));
    scheduler.add_dependency(never.id(), gate.id())?;
    let gated = scheduler.execute_delayed(&gate, Priority::Low, Duration::from_secs(3600))?;
    let downstream = scheduler.execute(&never, Priority::Medium)?;
    scheduler.cancel(gate.id())?;
    if let Err(e) = gated.await {
        info!("Gate task ended with: {}", e);
    }
    match downstream.await {
        Err(TaskError::DependencyFailed { dependency }) => {
            info!("Task {} rejected because {} was cancelled", never.id(), dependency)
        }
        other => warn!("Unexpected outcome for dependent task: {:?}", other),
    }
    Ok(())
}

async fn run_group(scheduler: &Scheduler) -> anyhow::Result<()> {
    let group = scheduler.task_group("shards");
    for shard in 0..4 {
        let task = scheduler.create_task(format!("shard-{}", shard), move |_| {
            Ok(json!({ "shard": shard }))
        });
        group.add_task(&task)?;
    }
    let results = group.execute(Priority::Medium)?.await?;
    info!("Group '{}' produced {} results", group.name(), results.len());
    Ok(())
}

async fn run_sequence(scheduler: &Scheduler) -> anyhow::Result<()> {
    let runner = scheduler.global_sequence_runner("journal", Priority::Medium)?;
    let written = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for entry in 0..5 {
        let written = written.clone();
        let task = scheduler.create_task(format!("journal-{}", entry), move |_| {
            let position = written.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "entry": entry, "position": position }))
        });
        handles.push(runner.execute(&task)?);
    }
    for handle in handles {
        handle.await?;
    }
    info!("Sequence runner wrote {} entries in order", written.load(Ordering::SeqCst));
    Ok(())
}

async fn run_contended_lock(scheduler: &Scheduler) -> anyhow::Result<()> {
    let lock = scheduler.locks().request("counter");
    let counter = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..6 {
        let lock = lock.clone();
        let counter = counter.clone();
        handles.push(scheduler.submit(
            move |_| {
                let value = lock.with_lock(
                    LockMode::Exclusive,
                    LockOptions::new().with_timeout(Duration::from_secs(5)),
                    || {
                        let current = counter.load(Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(2));
                        counter.store(current + 1, Ordering::SeqCst);
                        current + 1
                    },
                )?;
                Ok(json!(value))
            },
            Priority::Medium,
            &[],
        )?);
    }
    for handle in handles {
        handle.await?;
    }
    info!(
        "Lock '{}' serialized {} increments",
        lock.name(),
        counter.load(Ordering::SeqCst)
    );
    Ok(())
}
