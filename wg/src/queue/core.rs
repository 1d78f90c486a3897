//! Work queue implementation

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use gatestore::{
    JobCounts, JobKind, JobOutcome, JobRecord, MemoryStore, Priority, Store, StoreError, now_ms,
};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::events::EventEmitter;

use super::config::QueueConfig;
use super::handler::{HandlerRegistry, JobHandler, JobPayload};
use super::reports::{
    CancelReport, CancelResult, JobView, KindStatus, QueueStatusReport, QueueTotals, StatusReport,
    StatusSummary,
};

/// Errors surfaced to producers
///
/// A store outage is not among them: enqueue falls back to the local
/// overlay and reports success, flagged through [`WorkQueue::degraded`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The typed payload did not serialize
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// The store answered but rejected the operation
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which store a claim came from; outcomes settle against the same one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimSource {
    Primary,
    Overlay,
}

/// A terminal outcome that could not reach the primary store. The claim
/// there still holds a running slot, so it is settled on recovery.
struct PendingFinish {
    id: String,
    kind: JobKind,
    outcome: JobOutcome,
}

struct QueueCore {
    primary: Arc<dyn Store>,
    overlay: MemoryStore,
    config: QueueConfig,
    registry: HandlerRegistry,
    emitter: EventEmitter,
    notify: Notify,
    degraded: AtomicBool,
    pending_finishes: Mutex<Vec<PendingFinish>>,
}

impl QueueCore {
    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn mark_degraded(&self, reason: &str) {
        if self
            .degraded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!(reason, "QueueCore::mark_degraded: shared store unreachable, switching to the local overlay");
            self.emitter.store_degraded(reason);
        }
    }

    fn mark_recovered(&self) {
        if self
            .degraded
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("QueueCore::mark_recovered: shared store reachable again");
            self.emitter.store_recovered();
        }
    }

    /// Persist a new job, preferring the primary store
    async fn put(&self, job: &JobRecord) -> Result<(), QueueError> {
        if !self.is_degraded() {
            match self.primary.put_job(job).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unavailable() => self.mark_degraded(&e.to_string()),
                Err(e) => return Err(e.into()),
            }
        }
        // Unreachable primary: accept locally, replay on recovery
        self.overlay.put_job(job).await.map_err(QueueError::from)
    }

    /// Claim the best queued job of `kind`, honoring its ceiling
    async fn claim(&self, kind: JobKind) -> Option<(JobRecord, ClaimSource)> {
        let limit = self.config.ceiling_for(kind);
        if self.is_degraded() {
            return self.claim_overlay(kind, limit).await;
        }
        match self.primary.claim_next(kind, limit).await {
            Ok(Some(job)) => Some((job, ClaimSource::Primary)),
            Ok(None) => None,
            Err(e) if e.is_unavailable() => {
                self.mark_degraded(&e.to_string());
                self.claim_overlay(kind, limit).await
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "QueueCore::claim: store refused the claim");
                None
            }
        }
    }

    async fn claim_overlay(&self, kind: JobKind, limit: u32) -> Option<(JobRecord, ClaimSource)> {
        self.overlay
            .claim_next(kind, limit)
            .await
            .ok()
            .flatten()
            .map(|job| (job, ClaimSource::Overlay))
    }

    /// Run the handler for one claimed job and settle the outcome
    async fn execute(&self, job: JobRecord, source: ClaimSource, handler: Arc<dyn JobHandler>) {
        let started = std::time::Instant::now();
        debug!(job_id = %job.id, kind = %job.kind, ?source, "QueueCore::execute: job started");
        self.emitter.job_started(&job.id, job.kind.as_str());

        // A panicking handler fails its job, never the worker
        let outcome = match AssertUnwindSafe(handler.run(job.payload.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => JobOutcome::Completed(value),
            Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
            Err(_) => JobOutcome::Failed("handler panicked".to_string()),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            JobOutcome::Completed(_) => {
                debug!(job_id = %job.id, duration_ms, "QueueCore::execute: job completed");
                self.emitter.job_completed(&job.id, job.kind.as_str(), duration_ms);
            }
            JobOutcome::Failed(error) => {
                warn!(job_id = %job.id, error, "QueueCore::execute: job failed");
                self.emitter.job_failed(&job.id, job.kind.as_str(), error);
            }
        }

        self.finish(&job, source, outcome).await;
        // The freed slot may unblock the next claim
        self.notify.notify_waiters();
    }

    /// Write a terminal outcome to the store that holds the claim
    async fn finish(&self, job: &JobRecord, source: ClaimSource, outcome: JobOutcome) {
        match source {
            ClaimSource::Overlay => {
                if let Ok(false) = self.overlay.finish_job(&job.id, job.kind, &outcome).await {
                    debug!(job_id = %job.id, "QueueCore::finish: record lapsed before the outcome landed");
                }
            }
            ClaimSource::Primary => match self.primary.finish_job(&job.id, job.kind, &outcome).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, "QueueCore::finish: record lapsed before the outcome landed");
                }
                Err(e) if e.is_unavailable() => {
                    self.mark_degraded(&e.to_string());
                    // Keep the outcome readable locally; the running slot in
                    // the primary is settled once it is back
                    let mut finished = job.clone();
                    finished.finish(&outcome, now_ms());
                    self.overlay.record_terminal(&finished).await;
                    self.pending_finishes.lock().await.push(PendingFinish {
                        id: job.id.clone(),
                        kind: job.kind,
                        outcome,
                    });
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "QueueCore::finish: store rejected the outcome");
                }
            },
        }
    }

    /// Fetch a record, falling back to the overlay for jobs the primary
    /// never saw (or cannot serve right now)
    async fn get_job(&self, id: &str) -> Option<JobRecord> {
        if !self.is_degraded() {
            match self.primary.get_job(id).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {}
                Err(e) if e.is_unavailable() => self.mark_degraded(&e.to_string()),
                Err(e) => warn!(%id, error = %e, "QueueCore::get_job: read failed"),
            }
        }
        self.overlay.get_job(id).await.ok().flatten()
    }

    /// Cancel one job wherever it currently lives
    async fn cancel_one(&self, id: &str) -> bool {
        let Some(record) = self.get_job(id).await else {
            return false;
        };
        let cancelled = if self.is_degraded() {
            self.overlay.cancel_job(id).await.unwrap_or(false)
        } else {
            match self.primary.cancel_job(id).await {
                Ok(true) => true,
                // Not in the primary: the job may still sit in the overlay
                // waiting for replay
                Ok(false) => self.overlay.cancel_job(id).await.unwrap_or(false),
                Err(e) if e.is_unavailable() => {
                    self.mark_degraded(&e.to_string());
                    self.overlay.cancel_job(id).await.unwrap_or(false)
                }
                Err(e) => {
                    warn!(%id, error = %e, "QueueCore::cancel_one: store refused the cancel");
                    false
                }
            }
        };
        if cancelled {
            debug!(job_id = %id, kind = %record.kind, "QueueCore::cancel_one: cancelled");
            self.emitter.job_cancelled(&record.id, record.kind.as_str());
        }
        cancelled
    }

    /// Counters for one kind from whichever store is authoritative now
    async fn counts(&self, kind: JobKind) -> JobCounts {
        if !self.is_degraded() {
            match self.primary.counts(kind).await {
                Ok(counts) => return counts,
                Err(e) if e.is_unavailable() => self.mark_degraded(&e.to_string()),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "QueueCore::counts: read failed");
                    return JobCounts::default();
                }
            }
        }
        self.overlay.counts(kind).await.unwrap_or_default()
    }

    /// One maintenance pass: recovery probe while degraded; deferred
    /// settlement, overlay straggler drain, and retention sweep while
    /// healthy
    async fn maintain(&self) {
        if self.is_degraded() {
            if self.primary.ping().await.is_ok() {
                self.recover().await;
            }
        } else {
            self.settle_pending().await;
            // An enqueue that raced the recovery replay is parked queued
            // in the overlay; healthy claims read only the primary
            match self.replay_queued().await {
                Some(0) | None => {}
                Some(moved) => {
                    debug!(moved, "QueueCore::maintain: overlay stragglers moved to the primary");
                    self.notify.notify_waiters();
                }
            }
            match self.primary.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "QueueCore::maintain: primary records dropped"),
                Err(e) if e.is_unavailable() => self.mark_degraded(&e.to_string()),
                Err(e) => warn!(error = %e, "QueueCore::maintain: purge failed"),
            }
        }
        if let Ok(purged) = self.overlay.purge_expired().await {
            if purged > 0 {
                debug!(purged, "QueueCore::maintain: overlay records dropped");
            }
        }
    }

    /// Replay overlay state into the primary and leave degraded mode
    async fn recover(&self) {
        let Some(replayed) = self.replay_queued().await else {
            return;
        };
        if !self.settle_pending().await {
            return;
        }
        if replayed > 0 {
            info!(replayed, "QueueCore::recover: queued jobs replayed into the shared store");
        }
        self.mark_recovered();
        self.notify.notify_waiters();
    }

    /// Drain still-queued overlay jobs into the primary in claim order
    ///
    /// Returns how many moved, or `None` when the primary interrupted the
    /// drain; the unreplayed remainder goes back to the overlay either
    /// way.
    async fn replay_queued(&self) -> Option<u64> {
        let queued = self.overlay.take_queued().await;
        let total = queued.len();
        for (i, job) in queued.iter().enumerate() {
            if let Err(e) = self.primary.put_job(job).await {
                warn!(error = %e, replayed = i, total, "QueueCore::replay_queued: replay interrupted, remainder kept on the overlay");
                for job in &queued[i..] {
                    let _ = self.overlay.put_job(job).await;
                }
                if e.is_unavailable() {
                    self.mark_degraded(&e.to_string());
                }
                return None;
            }
        }
        Some(total as u64)
    }

    /// Settle deferred outcomes against the primary. Returns false when
    /// the store went away again mid-drain.
    async fn settle_pending(&self) -> bool {
        loop {
            let next = self.pending_finishes.lock().await.pop();
            let Some(pending) = next else {
                return true;
            };
            match self
                .primary
                .finish_job(&pending.id, pending.kind, &pending.outcome)
                .await
            {
                // False means the record lapsed; the slot is back either way
                Ok(wrote) => {
                    debug!(job_id = %pending.id, wrote, "QueueCore::settle_pending: deferred outcome settled");
                }
                Err(e) => {
                    warn!(job_id = %pending.id, error = %e, "QueueCore::settle_pending: settlement failed");
                    self.pending_finishes.lock().await.push(pending);
                    if e.is_unavailable() {
                        self.mark_degraded(&e.to_string());
                    }
                    return false;
                }
            }
        }
    }
}

/// Priority work queue over the shared store
///
/// One instance per process, cheap to clone and hand to every producer.
/// Producers enqueue and inspect; [`WorkQueue::run`] drives the worker
/// loops that claim and execute jobs for the kinds registered in this
/// process. When the shared store is unreachable the queue keeps
/// accepting and running jobs against a process-local overlay, then
/// replays still-queued work once the store returns.
#[derive(Clone)]
pub struct WorkQueue {
    core: Arc<QueueCore>,
}

impl WorkQueue {
    pub fn new(
        store: Arc<dyn Store>,
        config: QueueConfig,
        registry: HandlerRegistry,
        emitter: EventEmitter,
    ) -> Self {
        debug!(
            kinds = registry.len(),
            default_ceiling = config.default_ceiling,
            "WorkQueue::new: called"
        );
        Self {
            core: Arc::new(QueueCore {
                primary: store,
                overlay: MemoryStore::new(),
                config,
                registry,
                emitter,
                notify: Notify::new(),
                degraded: AtomicBool::new(false),
                pending_finishes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Enqueue a typed payload on its kind's queue
    pub async fn enqueue<P: JobPayload>(&self, payload: &P, size_hint: u64) -> Result<String, QueueError> {
        let value = serde_json::to_value(payload)?;
        self.enqueue_raw(P::KIND, value, size_hint).await
    }

    /// Enqueue an opaque payload
    ///
    /// The size hint maps onto the priority band and is kept on the
    /// record for observability. Returns the generated job id.
    pub async fn enqueue_raw(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        size_hint: u64,
    ) -> Result<String, QueueError> {
        let priority = Priority::from_size_hint(size_hint, &self.core.config.bands);
        let job = JobRecord::new(kind, priority, payload, size_hint, self.core.config.retention_ttl_ms);
        debug!(
            job_id = %job.id,
            kind = %kind,
            priority = %priority,
            size_hint,
            "WorkQueue::enqueue: accepted"
        );
        self.core.put(&job).await?;
        self.core
            .emitter
            .job_queued(&job.id, kind.as_str(), &priority.to_string());
        self.core.notify.notify_waiters();
        Ok(job.id)
    }

    /// Report per-job state for the requested ids
    ///
    /// Ids that are unknown or past retention count as `not_found` in the
    /// summary; they are never an error.
    pub async fn status(&self, ids: &[String]) -> StatusReport {
        let mut jobs = Vec::new();
        let mut summary = StatusSummary::default();
        for id in ids {
            match self.core.get_job(id).await {
                Some(record) => {
                    summary.bump(record.state);
                    jobs.push(JobView::from(record));
                }
                None => summary.not_found += 1,
            }
        }
        StatusReport { jobs, summary }
    }

    /// Cancel every requested job that is still queued
    ///
    /// Running jobs run to completion; their entries report
    /// `cancelled: false`, as do unknown ids.
    pub async fn cancel(&self, ids: &[String]) -> CancelReport {
        let mut results = Vec::with_capacity(ids.len());
        let mut cancelled = 0u64;
        for id in ids {
            let ok = self.core.cancel_one(id).await;
            if ok {
                cancelled += 1;
            }
            results.push(CancelResult {
                id: id.clone(),
                cancelled: ok,
            });
        }
        CancelReport {
            cancelled,
            total: ids.len() as u64,
            results,
        }
    }

    /// Aggregate counters across every kind
    pub async fn queue_status(&self) -> QueueStatusReport {
        let mut types = std::collections::BTreeMap::new();
        let mut stats = QueueTotals::default();
        for kind in JobKind::ALL {
            let counts = self.core.counts(kind).await;
            stats.total_queued += counts.queued;
            stats.total_running += counts.running;
            stats.total_completed += counts.completed;
            stats.total_failed += counts.failed;
            types.insert(kind.to_string(), KindStatus::from(counts));
        }
        QueueStatusReport {
            types,
            stats,
            degraded: self.core.is_degraded(),
        }
    }

    /// True while this process runs against its local overlay
    pub fn degraded(&self) -> bool {
        self.core.is_degraded()
    }

    /// Drop records past retention now instead of waiting for maintenance
    ///
    /// With the primary unreachable this sweeps the overlay instead of
    /// failing, flipping the queue to its local view on the way.
    pub async fn purge_expired(&self) -> Result<u64, QueueError> {
        if self.core.is_degraded() {
            return Ok(self.core.overlay.purge_expired().await.unwrap_or(0));
        }
        match self.core.primary.purge_expired().await {
            Ok(purged) => Ok(purged + self.core.overlay.purge_expired().await.unwrap_or(0)),
            Err(e) if e.is_unavailable() => {
                self.core.mark_degraded(&e.to_string());
                Ok(self.core.overlay.purge_expired().await.unwrap_or(0))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drive the worker and maintenance loops until shutdown
    ///
    /// One worker loop per registered kind. Workers drain their in-flight
    /// handlers before this returns.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(kinds = self.core.registry.len(), "WorkQueue starting");
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        for (kind, handler) in self.core.registry.entries() {
            tasks.push(tokio::spawn(worker_loop(
                self.core.clone(),
                kind,
                handler,
                stop_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(maintenance_loop(self.core.clone(), stop_rx.clone())));
        drop(stop_rx);

        // A closed channel (sender dropped) also means shutdown
        let _ = shutdown_rx.recv().await;
        debug!("WorkQueue::run: shutdown signal received");
        let _ = stop_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
        info!("WorkQueue stopped");
    }
}

/// Claim-and-execute loop for one kind
///
/// Claims as long as the store hands out jobs (the ceiling lives in the
/// claim itself), running each handler as its own task. When nothing is
/// claimable it waits for an enqueue nudge or the poll interval.
async fn worker_loop(
    core: Arc<QueueCore>,
    kind: JobKind,
    handler: Arc<dyn JobHandler>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(kind = %kind, "worker_loop: started");
    let mut running = JoinSet::new();
    loop {
        if *stop.borrow() {
            break;
        }
        while running.try_join_next().is_some() {}
        match core.claim(kind).await {
            Some((job, source)) => {
                let core = core.clone();
                let handler = handler.clone();
                running.spawn(async move {
                    core.execute(job, source, handler).await;
                });
            }
            None => {
                tokio::select! {
                    _ = core.notify.notified() => {}
                    _ = tokio::time::sleep(core.config.poll_interval()) => {}
                    _ = stop.changed() => break,
                }
            }
        }
    }
    // In-flight handlers finish before the worker exits
    while running.join_next().await.is_some() {}
    debug!(kind = %kind, "worker_loop: stopped");
}

async fn maintenance_loop(core: Arc<QueueCore>, mut stop: watch::Receiver<bool>) {
    debug!("maintenance_loop: started");
    let mut interval = tokio::time::interval(core.config.maintenance_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => core.maintain().await,
            _ = stop.changed() => break,
        }
    }
    debug!("maintenance_loop: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::queue::handler::{HandlerError, handler_fn, typed_handler};
    use gatestore::JobState;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Runner {
        queue: WorkQueue,
        bus: Arc<EventBus>,
        shutdown_tx: mpsc::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn build(config: QueueConfig, registry: HandlerRegistry) -> (WorkQueue, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(256));
        let queue = WorkQueue::new(
            Arc::new(MemoryStore::new()),
            config,
            registry,
            bus.emitter_for("queue"),
        );
        (queue, bus)
    }

    fn start(config: QueueConfig, registry: HandlerRegistry) -> Runner {
        let (queue, bus) = build(config, registry);
        start_queue(queue, bus)
    }

    fn start_queue(queue: WorkQueue, bus: Arc<EventBus>) -> Runner {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn({
            let queue = queue.clone();
            async move { queue.run(shutdown_rx).await }
        });
        Runner {
            queue,
            bus,
            shutdown_tx,
            handle,
        }
    }

    async fn stop(runner: Runner) {
        let _ = runner.shutdown_tx.send(()).await;
        let _ = runner.handle.await;
    }

    async fn wait_for_state(queue: &WorkQueue, id: &str, state: JobState) {
        for _ in 0..300 {
            let report = queue.status(&[id.to_string()]).await;
            if report.jobs.first().map(|j| j.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, state);
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            poll_interval_ms: 20,
            maintenance_interval_ms: 50,
            ..Default::default()
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ReportRequest {
        segment: String,
    }

    impl JobPayload for ReportRequest {
        const KIND: JobKind = JobKind::Report;
    }

    #[tokio::test]
    async fn test_enqueue_runs_to_completion() {
        let registry = HandlerRegistry::new().with(
            JobKind::Analysis,
            handler_fn(|payload| async move { Ok(json!({ "analyzed": payload["url"] })) }),
        );
        let runner = start(fast_config(), registry);

        let id = runner
            .queue
            .enqueue_raw(JobKind::Analysis, json!({"url": "https://acme.test"}), 2)
            .await
            .unwrap();
        wait_for_state(&runner.queue, &id, JobState::Completed).await;

        let report = runner.queue.status(&[id.clone()]).await;
        let job = &report.jobs[0];
        assert_eq!(job.kind, "analysis");
        assert_eq!(job.priority, 1);
        assert_eq!(job.result, Some(json!({"analyzed": "https://acme.test"})));
        assert!(job.error.is_none());
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert_eq!(report.summary.completed, 1);
        assert!(!runner.queue.degraded());

        stop(runner).await;
    }

    #[tokio::test]
    async fn test_priority_bands_execute_in_order() {
        // Size hints 1, 50, 3 map to bands 1, 3, 1; with a ceiling of one
        // the two band-1 jobs run first, in enqueue order
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new().with(JobKind::Report, {
            let order = order.clone();
            handler_fn(move |payload| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(payload["hint"].as_u64().unwrap());
                    Ok(json!(null))
                }
            })
        });
        let config = QueueConfig {
            ceilings: HashMap::from([(JobKind::Report, 1)]),
            ..fast_config()
        };
        let (queue, bus) = build(config, registry);

        let mut ids = Vec::new();
        for hint in [1u64, 50, 3] {
            ids.push(
                queue
                    .enqueue_raw(JobKind::Report, json!({ "hint": hint }), hint)
                    .await
                    .unwrap(),
            );
        }
        let report = queue.status(&ids).await;
        let bands: Vec<u8> = report.jobs.iter().map(|j| j.priority).collect();
        assert_eq!(bands, vec![1, 3, 1]);

        let runner = start_queue(queue, bus);
        for id in &ids {
            wait_for_state(&runner.queue, id, JobState::Completed).await;
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 3, 50]);

        stop(runner).await;
    }

    #[tokio::test]
    async fn test_cancel_before_pickup_skips_handler() {
        let side_effects = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new().with(JobKind::Outreach, {
            let side_effects = side_effects.clone();
            handler_fn(move |_| {
                let side_effects = side_effects.clone();
                async move {
                    side_effects.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
        });
        // No workers yet: the job stays queued
        let (queue, bus) = build(fast_config(), registry);
        let id = queue
            .enqueue_raw(JobKind::Outreach, json!({"lead": 7}), 1)
            .await
            .unwrap();

        let report = queue.cancel(&[id.clone()]).await;
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.total, 1);
        assert!(report.results[0].cancelled);
        assert_eq!(
            queue.status(&[id.clone()]).await.jobs[0].state,
            JobState::Cancelled
        );

        // Workers come up and must leave the cancelled job alone
        let runner = start_queue(queue, bus);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(side_effects.load(Ordering::SeqCst), 0);
        assert_eq!(
            runner.queue.status(&[id]).await.jobs[0].state,
            JobState::Cancelled
        );

        stop(runner).await;
    }

    #[tokio::test]
    async fn test_cancel_running_and_unknown_report_false() {
        let registry = HandlerRegistry::new().with(
            JobKind::Analysis,
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!(null))
            }),
        );
        let runner = start(fast_config(), registry);

        let id = runner
            .queue
            .enqueue_raw(JobKind::Analysis, json!({}), 1)
            .await
            .unwrap();
        wait_for_state(&runner.queue, &id, JobState::Running).await;

        let report = runner.queue.cancel(&[id.clone(), "no-such-job".to_string()]).await;
        assert_eq!(report.cancelled, 0);
        assert_eq!(report.total, 2);
        assert!(!report.results[0].cancelled);
        assert!(!report.results[1].cancelled);

        // The running job was untouched and finishes normally
        wait_for_state(&runner.queue, &id, JobState::Completed).await;
        stop(runner).await;
    }

    #[tokio::test]
    async fn test_handler_error_fails_job_without_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new().with(JobKind::Prospecting, {
            let attempts = attempts.clone();
            handler_fn(move |_| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::msg("source site unreachable"))
                }
            })
        });
        let runner = start(fast_config(), registry);

        let id = runner
            .queue
            .enqueue_raw(JobKind::Prospecting, json!({"segment": "saas"}), 5)
            .await
            .unwrap();
        wait_for_state(&runner.queue, &id, JobState::Failed).await;

        let report = runner.queue.status(&[id.clone()]).await;
        assert_eq!(report.jobs[0].error.as_deref(), Some("source site unreachable"));
        assert!(report.jobs[0].result.is_none());

        // Failed is terminal: the handler never runs again
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let status = runner.queue.queue_status().await;
        assert_eq!(status.types["prospecting"].failed, 1);
        assert_eq!(status.stats.total_failed, 1);

        stop(runner).await;
    }

    #[tokio::test]
    async fn test_handler_panic_fails_job() {
        let registry = HandlerRegistry::new().with(
            JobKind::Analysis,
            handler_fn(|_| async move { panic!("bug in the handler") }),
        );
        let runner = start(fast_config(), registry);

        let id = runner
            .queue
            .enqueue_raw(JobKind::Analysis, json!({}), 1)
            .await
            .unwrap();
        wait_for_state(&runner.queue, &id, JobState::Failed).await;

        let report = runner.queue.status(&[id.clone()]).await;
        assert_eq!(report.jobs[0].error.as_deref(), Some("handler panicked"));

        // The worker survived: a second job still runs
        let id2 = runner
            .queue
            .enqueue_raw(JobKind::Analysis, json!({}), 1)
            .await
            .unwrap();
        wait_for_state(&runner.queue, &id2, JobState::Failed).await;

        stop(runner).await;
    }

    #[tokio::test]
    async fn test_status_counts_not_found() {
        let (queue, _bus) = build(fast_config(), HandlerRegistry::new());
        let report = queue
            .status(&["ghost-1".to_string(), "ghost-2".to_string()])
            .await;
        assert!(report.jobs.is_empty());
        assert_eq!(report.summary.not_found, 2);
        assert_eq!(report.summary.queued, 0);
    }

    #[tokio::test]
    async fn test_queue_status_aggregates_kinds() {
        let registry = HandlerRegistry::new().with(
            JobKind::Analysis,
            handler_fn(|_| async { Ok(json!(null)) }),
        );
        let runner = start(fast_config(), registry);

        let done = runner
            .queue
            .enqueue_raw(JobKind::Analysis, json!({}), 1)
            .await
            .unwrap();
        wait_for_state(&runner.queue, &done, JobState::Completed).await;

        // No handler for report in this process: it stays queued
        runner
            .queue
            .enqueue_raw(JobKind::Report, json!({}), 1)
            .await
            .unwrap();
        let cancelled = runner
            .queue
            .enqueue_raw(JobKind::Report, json!({}), 1)
            .await
            .unwrap();
        runner.queue.cancel(&[cancelled]).await;

        let status = runner.queue.queue_status().await;
        assert_eq!(status.types.len(), JobKind::ALL.len());
        assert_eq!(status.types["analysis"].completed, 1);
        assert_eq!(status.types["report"].queued, 1);
        assert_eq!(status.types["report"].total, 2, "cancelled counts into total");
        assert_eq!(status.stats.total_completed, 1);
        assert_eq!(status.stats.total_queued, 1);
        assert!(!status.degraded);

        stop(runner).await;
    }

    #[tokio::test]
    async fn test_expired_jobs_become_not_found() {
        let config = QueueConfig {
            retention_ttl_ms: 40,
            ..fast_config()
        };
        let (queue, _bus) = build(config, HandlerRegistry::new());

        let id = queue
            .enqueue_raw(JobKind::Report, json!({}), 1)
            .await
            .unwrap();
        assert_eq!(queue.status(&[id.clone()]).await.summary.queued, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let purged = queue.purge_expired().await.unwrap();
        assert!(purged >= 1);

        let report = queue.status(&[id]).await;
        assert!(report.jobs.is_empty());
        assert_eq!(report.summary.not_found, 1);
    }

    #[tokio::test]
    async fn test_typed_enqueue_lands_on_its_kind() {
        let registry = HandlerRegistry::new().with(
            JobKind::Report,
            typed_handler(|req: ReportRequest| async move {
                Ok(json!({ "segment": req.segment }))
            }),
        );
        let runner = start(fast_config(), registry);

        let id = runner
            .queue
            .enqueue(
                &ReportRequest {
                    segment: "fintech".to_string(),
                },
                2,
            )
            .await
            .unwrap();
        wait_for_state(&runner.queue, &id, JobState::Completed).await;

        let report = runner.queue.status(&[id]).await;
        assert_eq!(report.jobs[0].kind, "report");
        assert_eq!(report.jobs[0].result, Some(json!({"segment": "fintech"})));

        stop(runner).await;
    }

    #[tokio::test]
    async fn test_events_trace_the_lifecycle() {
        let registry = HandlerRegistry::new().with(
            JobKind::Analysis,
            handler_fn(|_| async { Ok(json!(null)) }),
        );
        let runner = start(fast_config(), registry);
        let mut rx = runner.bus.subscribe();

        let id = runner
            .queue
            .enqueue_raw(JobKind::Analysis, json!({}), 1)
            .await
            .unwrap();
        wait_for_state(&runner.queue, &id, JobState::Completed).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.job_id() == Some(id.as_str()) {
                seen.push(event.event_type());
            }
        }
        assert_eq!(seen, vec!["JobQueued", "JobStarted", "JobCompleted"]);

        stop(runner).await;
    }
}
