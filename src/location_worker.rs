//! Location ingest worker: durable persistence with bounded backpressure,
//! then geofence dispatch, room fan-out, and last-seen bookkeeping.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::circles_repo::DynCirclesRepo;
use crate::config::LocationConfig;
use crate::error::{StoreError, SubmitError};
use crate::geofence_worker::{GeofenceJob, GeofenceWorkerHandle};
use crate::hub::HubHandle;
use crate::locations::LocationSample;
use crate::locations_repo::DynLocationsRepo;
use crate::protocol::Frame;
use crate::room::BroadcastFilter;
use crate::users_repo::DynUsersRepo;

const REPO_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LocationJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub location: LocationSample,
    pub enqueued_at: DateTime<Utc>,
    /// Advisory only; the queue itself is FIFO.
    pub priority: u8,
    pub retry_count: u32,
}

impl LocationJob {
    pub fn new(location: LocationSample) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: location.user_id,
            priority: location.advisory_priority(),
            location,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}

#[derive(Clone)]
pub struct LocationWorkerHandle {
    tx: flume::Sender<LocationJob>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl LocationWorkerHandle {
    /// Non-blocking submission; the bounded queue is the overload shed
    /// point for the whole ingest path.
    pub fn submit(&self, sample: LocationSample) -> Result<(), SubmitError> {
        self.submit_job(LocationJob::new(sample))
    }

    pub fn submit_job(&self, job: LocationJob) -> Result<(), SubmitError> {
        match self.tx.try_send(job) {
            Ok(()) => {
                metrics::gauge!("location.queue.depth").set(self.tx.len() as f64);
                Ok(())
            }
            Err(flume::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("location.queue.dropped_total").increment(1);
                Err(SubmitError::QueueFull {
                    queue: "location",
                    capacity: self.capacity,
                })
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                Err(SubmitError::Closed { queue: "location" })
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct LocationWorker {
    config: LocationConfig,
    locations_repo: DynLocationsRepo,
    circles_repo: DynCirclesRepo,
    users_repo: DynUsersRepo,
    geofence: GeofenceWorkerHandle,
    hub: HubHandle,
}

impl LocationWorker {
    pub fn new(
        config: LocationConfig,
        locations_repo: DynLocationsRepo,
        circles_repo: DynCirclesRepo,
        users_repo: DynUsersRepo,
        geofence: GeofenceWorkerHandle,
        hub: HubHandle,
    ) -> Self {
        Self {
            config,
            locations_repo,
            circles_repo,
            users_repo,
            geofence,
            hub,
        }
    }

    /// Spawn the worker pool (and the batch collector when enabled) and
    /// return the submission handle.
    pub fn spawn(self, cancel: CancellationToken) -> LocationWorkerHandle {
        let (work_tx, work_rx) = flume::bounded::<LocationJob>(self.config.queue_size);
        let batching = self.config.batching_enabled;
        let worker = Arc::new(self);

        for worker_id in 0..worker.config.worker_count.max(1) {
            let worker = worker.clone();
            let rx = work_rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        job = rx.recv_async() => match job {
                            Ok(job) => {
                                worker.process(job).await;
                                metrics::gauge!("location.queue.depth").set(rx.len() as f64);
                            }
                            Err(_) => break,
                        }
                    }
                }
                debug!(worker_id, "Location worker stopped");
            });
        }

        let handle = if batching {
            // The collector sits in front of the worker queue; per-job
            // semantics are unchanged, only scheduling is.
            let (batch_tx, batch_rx) = flume::bounded::<LocationJob>(worker.config.queue_size);
            let config = worker.config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_batch_collector(batch_rx, work_tx, config, cancel).await;
            });
            LocationWorkerHandle {
                tx: batch_tx,
                capacity: worker.config.queue_size,
                dropped: Arc::new(AtomicU64::new(0)),
            }
        } else {
            LocationWorkerHandle {
                tx: work_tx,
                capacity: worker.config.queue_size,
                dropped: Arc::new(AtomicU64::new(0)),
            }
        };

        info!(
            workers = worker.config.worker_count,
            queue = worker.config.queue_size,
            batching,
            "Location worker pool started"
        );
        handle
    }

    async fn process(&self, job: LocationJob) {
        if !self.persist(&job).await {
            return;
        }

        // Geofence evaluation is fire-and-forget from here; the shard
        // queue absorbs or sheds it.
        if let Err(e) = self.geofence.submit(GeofenceJob {
            user_id: job.user_id,
            location: job.location.clone(),
        }) {
            warn!(user = %job.user_id, error = %e, "Geofence dispatch dropped");
        }

        self.broadcast(&job).await;

        if let Err(e) = self
            .users_repo
            .set_online(job.user_id, true, Utc::now())
            .await
        {
            warn!(user = %job.user_id, error = %e, "Failed to update last seen");
        }

        metrics::counter!("location.processed_total").increment(1);
    }

    /// Persist with the configured retry budget. Exhausting it marks the
    /// job failed; the job is never re-executed afterwards.
    async fn persist(&self, job: &LocationJob) -> bool {
        let mut attempt = job.retry_count;
        loop {
            match tokio::time::timeout(
                REPO_CALL_TIMEOUT,
                self.locations_repo.append(&job.location),
            )
            .await
            {
                Ok(Ok(())) => return true,
                Ok(Err(StoreError::Fatal(e))) => {
                    error!(job = %job.id, error = %e, "Fatal store error, dropping location");
                    metrics::counter!("location.failed_total").increment(1);
                    return false;
                }
                Ok(Err(StoreError::Transient(e))) if attempt < self.config.retry_attempts => {
                    attempt += 1;
                    let delay = self.config.retry_delay() * attempt;
                    warn!(job = %job.id, error = %e, attempt, "Retrying location persist");
                    metrics::counter!("location.retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(e)) => {
                    error!(job = %job.id, error = %e, "Location persist failed after retries");
                    metrics::counter!("location.failed_total").increment(1);
                    return false;
                }
                Err(_) if attempt < self.config.retry_attempts => {
                    attempt += 1;
                    warn!(job = %job.id, attempt, "Location persist timed out, retrying");
                    tokio::time::sleep(self.config.retry_delay() * attempt).await;
                }
                Err(_) => {
                    error!(job = %job.id, "Location persist timed out after retries");
                    metrics::counter!("location.failed_total").increment(1);
                    return false;
                }
            }
        }
    }

    /// Fan the update out to every circle room with location sharing on.
    async fn broadcast(&self, job: &LocationJob) {
        let circles = match self.circles_repo.list_for_user(job.user_id).await {
            Ok(circles) => circles,
            Err(e) => {
                warn!(user = %job.user_id, error = %e, "Failed to list circles for broadcast");
                return;
            }
        };

        let frame = Frame::location_update(&job.location);
        for circle in circles {
            if !circle.settings.location_sharing {
                continue;
            }
            if let Err(e) =
                self.hub
                    .broadcast_to_room(circle.id, frame.clone(), BroadcastFilter::none())
            {
                debug!(circle = %circle.id, error = %e, "Location broadcast dropped");
            }
        }
    }
}

/// Accumulate jobs until the batch fills or the timeout lapses, then move
/// the whole batch to the worker queue.
async fn run_batch_collector(
    batch_rx: flume::Receiver<LocationJob>,
    work_tx: flume::Sender<LocationJob>,
    config: LocationConfig,
    cancel: CancellationToken,
) {
    let mut pending: Vec<LocationJob> = Vec::with_capacity(config.batch_size);
    loop {
        // The batch clock starts at its first job.
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Batch collector stopped");
                return;
            }
            job = batch_rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => return,
            }
        };
        pending.push(first);

        let deadline = tokio::time::sleep(config.batch_timeout());
        tokio::pin!(deadline);
        while pending.len() < config.batch_size {
            tokio::select! {
                _ = cancel.cancelled() => {
                    flush(&mut pending, &work_tx).await;
                    debug!("Batch collector stopped");
                    return;
                }
                _ = &mut deadline => break,
                job = batch_rx.recv_async() => match job {
                    Ok(job) => pending.push(job),
                    Err(_) => {
                        flush(&mut pending, &work_tx).await;
                        return;
                    }
                }
            }
        }

        metrics::histogram!("location.batch.size").record(pending.len() as f64);
        flush(&mut pending, &work_tx).await;
    }
}

async fn flush(pending: &mut Vec<LocationJob>, work_tx: &flume::Sender<LocationJob>) {
    for job in pending.drain(..) {
        if work_tx.send_async(job).await.is_err() {
            return;
        }
    }
}
