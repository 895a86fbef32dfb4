//! The claim, process, acknowledge loop.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use anyhow::Context;
use futures::FutureExt;
use log::{error, info, warn};
use uuid::Uuid;

use crate::job::{Job, JobContext};
use crate::pipeline::{panic_message, JobOutcome, Pipeline};
use crate::stream::{JobStream, StreamMessage, TASK_FIELD};

// pause after a failed claim so a broker outage does not spin the loop
const CLAIM_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Fresh consumer name for a worker process.
pub fn new_worker_id() -> String {
    Uuid::new_v4().to_string()
}

/// A single-job-at-a-time consumer of the job stream.
pub struct Worker<S: JobStream> {
    id: String,

    stream: S,

    pipeline: Pipeline,

    claim_block: Duration,
    // pending entries idle this long are taken over from dead consumers
    reclaim_idle: Option<Duration>,

    shutdown: Arc<AtomicBool>,
}

impl<S: JobStream> Worker<S> {
    pub fn new(id: String, stream: S, pipeline: Pipeline, claim_block: Duration) -> Self {
        Self {
            id: id,
            stream: stream,
            pipeline: pipeline,
            claim_block: claim_block,
            reclaim_idle: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_reclaim(mut self, idle: Option<Duration>) -> Self {
        self.reclaim_idle = idle;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Flag that stops the loop once the current job is done.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Sets up every stage and makes sure the consumer group exists.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.pipeline
            .setup()
            .await
            .context("Stage setup failed")?;
        self.stream
            .ensure_group()
            .await
            .context("Failed to create the consumer group")?;
        info!("Worker `{}` is ready.", self.id);
        Ok(())
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.start().await?;
        while !self.shutdown.load(Ordering::SeqCst) {
            self.poll_once().await;
        }
        info!("Worker `{}` is shutting down.", self.id);
        self.pipeline.teardown().await;
        Ok(())
    }

    /// One claim cycle; returns how many entries were handled.
    ///
    /// Stale entries of dead consumers are handled first, and only when
    /// there are none does the worker block for new ones.
    pub async fn poll_once(&mut self) -> usize {
        let mut batch = Vec::new();
        if let Some(idle) = self.reclaim_idle {
            match self.stream.reclaim_stale(idle).await {
                Ok(stale) => {
                    if !stale.is_empty() {
                        info!("Took over {} stale entries.", stale.len());
                    }
                    batch = stale;
                }

                Err(e) => warn!("Failed to reclaim stale entries: `{e}`"),
            }
        }
        if batch.is_empty() {
            match self.stream.claim(self.claim_block).await {
                Ok(claimed) => batch = claimed,

                Err(e) => {
                    warn!("Claim failed: `{e}`");
                    tokio::time::sleep(CLAIM_ERROR_PAUSE).await;
                }
            }
        }
        let count = batch.len();
        for message in batch {
            self.handle(message).await;
        }
        count
    }

    /// Processes one stream entry and acknowledges it whatever happens.
    ///
    /// Undecodable entries are discarded; the outcome is `None` for them and
    /// when the pipeline itself panicked.
    pub async fn handle(&mut self, message: StreamMessage) -> Option<JobOutcome> {
        let outcome = match message.task().map(Job::from_payload) {
            None => {
                error!("Entry `{}` has no `{TASK_FIELD}` field, discarded.", message.id);
                None
            }

            Some(Err(e)) => {
                error!("Entry `{}` carries a malformed job, discarded: `{e}`", message.id);
                None
            }

            Some(Ok(job)) => {
                let mut ctx = JobContext::new(job);
                match AssertUnwindSafe(self.pipeline.run(&mut ctx)).catch_unwind().await {
                    Ok(outcome) => Some(outcome),

                    Err(panic) => {
                        error!(
                            "Pipeline panicked on job `{}`: {}",
                            ctx.job_id(),
                            panic_message(panic.as_ref())
                        );
                        None
                    }
                }
            }
        };
        if let Err(e) = self.stream.ack(&message.id).await {
            warn!("Failed to acknowledge entry `{}`: `{e}`", message.id);
        }
        outcome
    }
}
