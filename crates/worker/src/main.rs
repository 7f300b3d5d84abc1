//! curation-worker: claims queued curation jobs and runs their pipelines.
//!
//! Flow per job: claim (Queued -> Processing), build the operator list
//! from the submitted pipeline spec, run it stage by stage on the local
//! backend, then report Finished / Failed / Stopped back to the registry.
//!
//! On startup the worker sweeps orphaned Processing jobs, then runs three
//! loops until SIGINT/SIGTERM: heartbeat upserts, the scheduler watch
//! (settling cluster-side jobs), and the queued-job poll.

mod io;
mod ops;
mod signal;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use curator_bridge::{HttpClusterScheduler, WorkflowBridge};
use curator_core::config::{load_dotenv, Config};
use curator_engine::{
    Backend, Capacity, Checkpointer, Dataset, DistributedBackend, HttpClusterEngine, LocalBackend,
    PipelineRunner, PipelineSpec, RunStatus, Tracer,
};
use curator_registry::{Job, JobLifecycleManager, JobStatus, JobStore, PgJobStore};

use signal::RegistryStopSignal;

// ── CLI ─────────────────────────────────────────────────────────────

/// Curation worker that executes data curation pipelines against the job registry.
#[derive(Parser, Debug)]
#[command(name = "curation-worker", version, about)]
struct Cli {
    /// Config profile ({PROFILE}_{KEY} env vars take precedence).
    #[arg(long, env = "CURATOR_PROFILE", default_value = "")]
    profile: String,

    /// Worker name override (defaults to WORKER_NAME).
    #[arg(long)]
    name: Option<String>,

    /// Run the orphan sweep and exit.
    #[arg(long, default_value_t = false)]
    sweep_only: bool,
}

// ── Worker ──────────────────────────────────────────────────────────

struct CurationWorker {
    lifecycle: Arc<JobLifecycleManager>,
    config: Config,
    worker_id: String,
    host: String,
}

impl CurationWorker {
    /// Claim and run every currently queued job, oldest first. Jobs run
    /// sequentially within one worker process; job-level parallelism
    /// comes from running more worker processes, each claiming its own
    /// jobs against the shared registry.
    async fn drain_queue(&self) {
        let queued = match self.lifecycle.store().list_jobs(JobStatus::Queued).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "queued-job poll failed");
                return;
            }
        };

        for job in queued {
            let claimed = match self
                .lifecycle
                .claim(job.id, &self.host, &self.worker_id, std::process::id() as i32)
                .await
            {
                Ok(job) => job,
                Err(e) => {
                    // Another worker got there first; move on.
                    warn!(job = %job.id, error = %e, "claim failed, skipping");
                    continue;
                }
            };
            self.run_job(claimed).await;
        }
    }

    /// Run one claimed job end to end and settle its terminal state.
    async fn run_job(&self, job: Job) {
        match self.execute(&job).await {
            Ok(ExecutionResult::Completed(count)) => {
                if let Err(e) = self.lifecycle.complete(job.id, count).await {
                    error!(job = %job.id, error = %e, "failed to record completion");
                }
            }
            Ok(ExecutionResult::Stopped) => {
                if let Err(e) = self.lifecycle.stop(job.id).await {
                    error!(job = %job.id, error = %e, "failed to record stop");
                }
            }
            Err(e) => {
                if let Err(report_err) = self.lifecycle.fail(job.id, &e.to_string()).await {
                    error!(job = %job.id, error = %report_err, "failed to record failure");
                }
            }
        }
    }

    async fn execute(&self, job: &Job) -> anyhow::Result<ExecutionResult> {
        let pipeline: PipelineSpec = serde_json::from_value(job.pipeline.clone())?;
        let operators = ops::default_registry().build(&pipeline)?;

        // A `remote:<dataset-id>` source runs on the cluster dataset
        // engine; anything else is a local JSONL path.
        let (backend, input): (Arc<dyn Backend>, Dataset) =
            if let Some(input) = io::remote_source(&pipeline.source) {
                let engine = Arc::new(HttpClusterEngine::new(self.config.cluster.engine_url.clone()));
                (Arc::new(DistributedBackend::new(engine)), input)
            } else {
                let records = io::read_jsonl(std::path::Path::new(&pipeline.source))?;
                (Arc::new(LocalBackend::new()), Dataset::local(records))
            };

        let store: Arc<dyn JobStore> = Arc::clone(self.lifecycle.store());
        let runner = PipelineRunner::new(backend, Capacity::detect(&self.config.engine))
            .with_tracer(Tracer::new(self.config.engine.trace_sample_size as usize))
            .with_checkpointer(Checkpointer::new(&self.config.engine.checkpoint_dir))
            .with_stop_signal(Arc::new(RegistryStopSignal::new(store, job.id)));

        let outcome = runner.run(job.id, &operators, input).await?;
        if outcome.report.status == RunStatus::Stopped {
            return Ok(ExecutionResult::Stopped);
        }

        let count = match outcome.dataset {
            Dataset::Local(records) => {
                let count = records.len() as i64;
                io::write_jsonl(std::path::Path::new(&pipeline.sink), &records)?;
                count
            }
            // Remote results stay in the engine; the sink records the handle.
            Dataset::Remote(remote) => {
                std::fs::write(&pipeline.sink, format!("remote:{}\n", remote.id))?;
                remote.record_count.unwrap_or(0) as i64
            }
        };
        curator_bridge::artifact::write_record_count(
            &self.config.cluster.artifacts_dir,
            job.id,
            count,
        )?;
        Checkpointer::new(&self.config.engine.checkpoint_dir).clear(job.id)?;
        Ok(ExecutionResult::Completed(count))
    }
}

enum ExecutionResult {
    Completed(i64),
    Stopped,
}

// ── main ────────────────────────────────────────────────────────────

async fn shutdown_on_signal(shutdown: Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                shutdown.notify_waiters();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("ctrl-c received");
    }
    shutdown.notify_waiters();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = Config::for_profile(&cli.profile);
    config.log_summary();

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::connect(&config.registry).await?);
    let staleness = Duration::from_secs(config.worker.heartbeat_staleness_secs);
    let lifecycle = Arc::new(JobLifecycleManager::new(store, staleness));

    let scheduler = Arc::new(HttpClusterScheduler::new(config.cluster.scheduler_url.clone()));
    let bridge = Arc::new(WorkflowBridge::new(
        scheduler,
        lifecycle.clone(),
        config.cluster.clone(),
    ));

    // Settle jobs left Processing by a previous worker generation.
    let sweep = lifecycle.sweep_orphans(bridge.as_ref()).await?;
    if cli.sweep_only {
        info!(failed = sweep.failed.len(), "sweep-only run complete");
        return Ok(());
    }

    let worker_id = cli.name.unwrap_or_else(|| config.worker.worker_name.clone());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    info!(worker = %worker_id, host = %host, "curation-worker starting");

    let shutdown = Arc::new(Notify::new());
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let heartbeat = {
        let lifecycle = lifecycle.clone();
        let shutdown = shutdown.clone();
        let worker_id = worker_id.clone();
        let host = host.clone();
        let interval = Duration::from_secs(config.worker.heartbeat_interval_secs);
        tokio::spawn(async move {
            lifecycle
                .heartbeat_loop(&worker_id, &host, interval, &shutdown)
                .await;
        })
    };

    let watch = {
        let bridge = bridge.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            bridge.run_watch(&shutdown).await;
        })
    };

    let worker = CurationWorker {
        lifecycle,
        config,
        worker_id,
        host,
    };

    let mut ticker =
        tokio::time::interval(Duration::from_secs(worker.config.worker.poll_interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => worker.drain_queue().await,
            _ = shutdown.notified() => break,
        }
    }

    info!("shutting down, waiting for background loops");
    let _ = heartbeat.await;
    let _ = watch.await;
    info!("curation-worker exited cleanly");
    Ok(())
}
