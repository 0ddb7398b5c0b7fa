//! Periodic background jobs: key rotation, retention purge, queue-depth sampling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::metrics::PipelineMetrics;
use crate::crypto::KeyRotationJob;
use crate::ingest::Broker;
use crate::store::RetentionJob;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawned job handles; await them after signalling shutdown
#[derive(Default)]
pub struct JobHandles {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl JobHandles {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(job = name, error = %e, "background job panicked");
            }
        }
    }
}

/// Schedules the background jobs that are enabled
pub struct JobScheduler {
    shutdown: watch::Receiver<bool>,
    handles: JobHandles,
}

impl JobScheduler {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shutdown,
            handles: JobHandles::default(),
        }
    }

    /// Re-encrypt under the primary key every `every`
    pub fn rotation(mut self, job: Arc<KeyRotationJob>, every: Duration) -> Self {
        let handle = spawn_interval(every, self.shutdown.clone(), move || {
            let job = job.clone();
            async move {
                match tokio::task::spawn_blocking(move || job.run_once()).await {
                    Ok(Ok(report)) => debug!(
                        scanned = report.scanned,
                        updated = report.updated,
                        "rotation pass"
                    ),
                    Ok(Err(e)) => warn!(error = %e, "rotation pass failed"),
                    Err(e) => error!(error = %e, "rotation task aborted"),
                }
            }
        });
        self.handles.handles.push(("rotation", handle));
        self
    }

    /// Hourly purge; skipped when retention is disabled
    pub fn retention(mut self, job: Arc<RetentionJob>) -> Self {
        if !job.is_enabled() {
            return self;
        }
        let handle = spawn_interval(RETENTION_INTERVAL, self.shutdown.clone(), move || {
            let job = job.clone();
            async move {
                match tokio::task::spawn_blocking(move || job.run_once()).await {
                    Ok(Ok(purged)) if purged > 0 => info!(purged, "retention purge"),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "retention purge failed"),
                    Err(e) => error!(error = %e, "retention task aborted"),
                }
            }
        });
        self.handles.handles.push(("retention", handle));
        self
    }

    /// Sample the main queue depth into `transcription_queue_depth`
    pub fn queue_depth(
        mut self,
        broker: Arc<dyn Broker>,
        queue: String,
        metrics: Arc<PipelineMetrics>,
        every: Duration,
    ) -> Self {
        let handle = spawn_interval(every, self.shutdown.clone(), move || {
            let broker = broker.clone();
            let queue = queue.clone();
            let metrics = metrics.clone();
            async move {
                match broker.depth(&queue).await {
                    Ok(depth) => metrics.transcription_queue_depth.set(depth),
                    Err(e) => debug!(queue = %queue, error = %e, "queue depth unavailable"),
                }
            }
        });
        self.handles.handles.push(("queue_depth", handle));
        self
    }

    pub fn start(self) -> JobHandles {
        info!(jobs = self.handles.len(), "background jobs started");
        self.handles
    }
}

/// Run `tick` every `every` until shutdown; the first run happens immediately
fn spawn_interval<F, Fut>(every: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let every = every.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    })
}
