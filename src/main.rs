#![doc = include_str!("../README.md")]

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};

use testrun_worker::{
    cache::{ArtifactCache, Category},
    config::Config,
    gateway::HttpGateway,
    pipeline::Pipeline,
    process::ProcessRunner,
    stage::StageDeps,
    stream::RedisStream,
    worker::{new_worker_id, Worker},
};

// exit status after a second interrupt
const FORCED_EXIT: i32 = 130;

// CLI
#[derive(Parser, Debug)]
#[command(name = "testrun-worker")]
#[command(version = "0.1")]
#[command(about = "Consumes algorithm test runs from a redis stream and \
                   executes them in a venv, a container or a cluster.",
          long_about = None)
]
struct Cli {
    /// TOML configuration file, overridden by environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume jobs until interrupted (the default)
    Run,

    /// Remove an entry from the artifact cache
    Evict {
        /// One of `algorithms`, `models`, `datasets`
        #[arg(long)]
        category: String,

        /// Entry name, e.g. `{gid}_{cid}` for algorithms
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let data_dir = config.data_dir()?;
    let cache = Arc::new(
        ArtifactCache::new(&data_dir)
            .with_context(|| format!("Failed to open the cache at `{}`", data_dir.display()))?,
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Evict { category, name } => {
            let category = Category::parse(&category).ok_or_else(|| {
                anyhow!("Unknown category `{category}`, expected algorithms, models or datasets")
            })?;
            cache.evict(category, &name)?;
            info!("Evicted `{category}/{name}`.");
            Ok(())
        }

        Commands::Run => run(config, cache).await,
    }
}

async fn run(config: Config, cache: Arc<ArtifactCache>) -> anyhow::Result<()> {
    info!("<-> Test-run worker <->");
    let config = Arc::new(config);
    info!("Cache root: `{}`", cache.root().display());

    let gateway = HttpGateway::new(&config.apigw_url, config.http_timeout(), config.fetch_retries)
        .context("Invalid gateway configuration")?;
    let deps = StageDeps {
        config: config.clone(),
        cache: cache,
        gateway: Arc::new(gateway),
        runner: Arc::new(ProcessRunner),
    };
    let pipeline = Pipeline::from_bindings(&config.stages, &deps)?;

    let worker_id = new_worker_id();
    info!(
        "Consuming `{}` at `{}:{}` as `{worker_id}`.",
        config.stream_name, config.broker_host, config.broker_port
    );
    let stream = RedisStream::connect(
        &config.broker_url()?,
        &config.stream_name,
        &config.group_name,
        &worker_id,
        config.claim_batch,
        config.claim_block(),
    )
    .await
    .context("Failed to connect to the broker")?;

    let mut worker = Worker::new(worker_id, stream, pipeline, config.claim_block())
        .with_reclaim(config.reclaim_idle());
    watch_signals(worker.shutdown_handle());
    worker.run().await
}

// first signal: stop after the current job; second signal: exit now
fn watch_signals(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("Interrupted, exiting once the current job is done.");
        shutdown.store(true, Ordering::SeqCst);
        wait_for_signal().await;
        warn!("Interrupted again, exiting now.");
        std::process::exit(FORCED_EXIT);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = terminate.recv() => {},
            }
        }

        Err(e) => {
            warn!("Cannot listen for SIGTERM: `{e}`");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
