// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use handoff_buffer::{BufferPool, MemoryBudget, WriteError};
use handoff_store::{HintsCatalog, StoreError};
use handoff_types::config::HintsOptions;
use handoff_types::hint::{HintRecord, MAX_TARGETS};
use handoff_types::identifiers::NodeId;
use handoff_types::time::MillisSinceEpoch;

use crate::delivery::HintDelivery;
use crate::dispatcher::{
    DispatchContext, DispatcherEvent, DispatcherHandle, DispatcherState, Dispatchers,
};
use crate::error::{RecordHintError, ShutdownError, StartError};
use crate::flusher::{FlushBarrier, Flusher};
use crate::lifecycle::{CleanupReport, LifecycleManager};
use crate::membership::{ClusterMembership, ReachabilityEvent};
use crate::metric_definitions::{
    DROP_REASON, DROP_REASON_BACKPRESSURE, DROP_REASON_RETIRED, HINTS_CREATED, HINTS_DROPPED,
    SEGMENTS_CORRUPTED, describe_metrics,
};

/// Buffers mutations for unreachable replicas and replays them once the replicas recover.
///
/// Writers call [`record_hint`](Self::record_hint). Hints are copied into in-memory arenas,
/// persisted per target by a single flush worker and delivered by one dispatcher per target.
/// All background work stops on [`shutdown`](Self::shutdown).
pub struct HintsService {
    options: HintsOptions,
    pool: Arc<BufferPool>,
    catalog: Arc<HintsCatalog>,
    dispatchers: Arc<Dispatchers>,
    lifecycle: Arc<LifecycleManager>,
    barriers: mpsc::UnboundedSender<FlushBarrier>,
    accepting: AtomicBool,
    cancel: CancellationToken,
    flusher_cancel: CancellationToken,
    flusher_task: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
}

impl HintsService {
    /// Recovers the hints stored under `hints-dir` and starts the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        options: HintsOptions,
        membership: Arc<dyn ClusterMembership>,
        delivery: Arc<dyn HintDelivery>,
    ) -> Result<Self, StartError> {
        options.validate()?;
        describe_metrics();

        let catalog = Arc::new(HintsCatalog::open(options.hints_dir.clone()).await?);
        let corrupted: usize = catalog
            .stores()
            .iter()
            .map(|store| store.corrupted_on_open())
            .sum();
        if corrupted > 0 {
            warn!(segments = corrupted, "Deleted invalid hints segments during recovery");
            counter!(SEGMENTS_CORRUPTED).increment(corrupted as u64);
        }

        let budget = MemoryBudget::new(options.max_buffered_bytes.as_usize());
        let (pool, arenas) = BufferPool::new(options.arena_size(), budget);
        let pool = Arc::new(pool);

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let flusher_cancel = CancellationToken::new();

        let ctx = Arc::new(DispatchContext {
            catalog: Arc::clone(&catalog),
            membership: Arc::clone(&membership),
            delivery,
            delivery_timeout: options.delivery_timeout.into(),
            retry_delay: options.retry_delay.into(),
            dispatch_throttle: options.dispatch_throttle(),
        });
        let dispatchers = Arc::new(Dispatchers::new(ctx, tracker.clone(), cancel.clone()));

        // subscribe before the dispatchers sample reachability so no transition is missed
        let reachability = membership.subscribe();
        for store in catalog.stores() {
            dispatchers.ensure(store);
        }

        let (barriers, barriers_rx) = mpsc::unbounded_channel();
        let flusher = Flusher::new(
            Arc::clone(&pool),
            Arc::clone(&catalog),
            Arc::clone(&dispatchers),
            options.flush_retry_policy.clone(),
            options.flush_interval.into(),
            arenas,
            barriers_rx,
        );
        let flusher_task = tracker.spawn(flusher.run(flusher_cancel.clone()));

        tracker.spawn(watch_membership(
            reachability,
            Arc::clone(&membership),
            Arc::clone(&dispatchers),
            cancel.clone(),
        ));

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&catalog),
            Arc::clone(&dispatchers),
            membership,
            options.max_disk_bytes(),
        ));
        tracker.spawn(
            Arc::clone(&lifecycle).run(options.cleanup_interval.into(), cancel.clone()),
        );

        info!(
            hints_dir = %options.hints_dir.display(),
            targets = catalog.targets().len(),
            stored_bytes = catalog.total_size_bytes(),
            "Hints service started"
        );

        Ok(Self {
            options,
            pool,
            catalog,
            dispatchers,
            lifecycle,
            barriers,
            accepting: AtomicBool::new(true),
            cancel,
            flusher_cancel,
            flusher_task: Mutex::new(Some(flusher_task)),
            tracker,
        })
    }

    pub fn options(&self) -> &HintsOptions {
        &self.options
    }

    /// Buffers `payload` for every target in `targets`.
    ///
    /// Returns once the hint is in memory, not once it is durable. Targets that were retired
    /// are left out; a hint left without targets that way is dropped and counted.
    pub async fn record_hint(
        &self,
        targets: impl IntoIterator<Item = NodeId>,
        payload: impl Into<Bytes>,
        ttl_seconds: u32,
    ) -> Result<(), RecordHintError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RecordHintError::Shutdown);
        }

        let requested: BTreeSet<NodeId> = targets.into_iter().collect();
        if requested.is_empty() {
            return Err(RecordHintError::NoTargets);
        }
        if requested.len() > MAX_TARGETS {
            return Err(RecordHintError::TooManyTargets(requested.len()));
        }

        let (live, retired): (BTreeSet<_>, BTreeSet<_>) = requested
            .into_iter()
            .partition(|target| !self.catalog.is_retired(*target));
        if !retired.is_empty() {
            trace!(?retired, "Not recording hints for retired targets");
            counter!(HINTS_DROPPED, DROP_REASON => DROP_REASON_RETIRED)
                .increment(retired.len() as u64);
        }
        if live.is_empty() {
            return Ok(());
        }

        let hint = HintRecord::new(live, payload, MillisSinceEpoch::now(), ttl_seconds);
        let size = hint.encoded_len();
        let limit = self.pool.arena_size().get();
        if size > limit {
            return Err(RecordHintError::TooLarge { size, limit });
        }

        let budget = self.pool.budget();
        let reservation = if self.options.drop_on_backpressure {
            match budget.try_reserve(size) {
                Some(reservation) => reservation,
                None => {
                    debug!(size, available = budget.available(), "Hint buffer is full, dropping hint");
                    counter!(HINTS_DROPPED, DROP_REASON => DROP_REASON_BACKPRESSURE).increment(1);
                    return Err(RecordHintError::Backpressure);
                }
            }
        } else {
            tokio::select! {
                reservation = budget.reserve(size) => reservation,
                _ = self.cancel.cancelled() => return Err(RecordHintError::Shutdown),
            }
        };

        match self.pool.write(&hint, reservation) {
            Ok(arena) => {
                trace!(%arena, size, targets = hint.targets().len(), "Recorded hint");
                counter!(HINTS_CREATED).increment(1);
                Ok(())
            }
            Err(WriteError::HintTooLarge { size, limit }) => {
                Err(RecordHintError::TooLarge { size, limit })
            }
            Err(WriteError::NoTargets) => Err(RecordHintError::NoTargets),
            Err(WriteError::Closed) => Err(RecordHintError::Shutdown),
        }
    }

    /// Bytes stored on disk for `target`.
    pub fn store_size(&self, target: NodeId) -> u64 {
        self.catalog
            .get(target)
            .map_or(0, |store| store.size_bytes())
    }

    /// Records stored on disk for `target` that were not delivered yet.
    pub fn pending_count(&self, target: NodeId) -> u64 {
        self.catalog
            .get(target)
            .map_or(0, |store| store.pending_count())
    }

    /// Deletes all hints for `target` and drops any recorded for it later.
    pub async fn force_retire(&self, target: NodeId) -> Result<(), StoreError> {
        self.dispatchers.retire(target).await?;
        info!(target = %target, "Retired hints target on request");
        Ok(())
    }

    pub fn dispatcher_state(&self, target: NodeId) -> Option<DispatcherState> {
        self.dispatchers.get(target).map(|handle| handle.state())
    }

    pub fn dispatcher(&self, target: NodeId) -> Option<DispatcherHandle> {
        self.dispatchers.get(target)
    }

    pub fn pause_dispatch(&self) {
        info!("Pausing hints dispatch");
        self.dispatchers.pause_all();
    }

    pub fn resume_dispatch(&self) {
        info!("Resuming hints dispatch");
        self.dispatchers.resume_all();
    }

    /// Deletes every stored hint of every target. Returns the number of deleted segments.
    pub async fn truncate_all_hints(&self) -> Result<usize, StoreError> {
        self.catalog.truncate_all().await
    }

    /// Waits until every hint recorded before this call is on disk.
    pub async fn flush(&self) -> Result<(), ShutdownError> {
        self.pool.flush_active().map_err(|_| ShutdownError)?;
        let (tx, rx) = oneshot::channel();
        self.barriers.send(tx).map_err(|_| ShutdownError)?;
        rx.await.map_err(|_| ShutdownError)
    }

    /// Runs one pass of membership reconciliation, expiry and quota enforcement.
    pub async fn run_cleanup(&self, now: MillisSinceEpoch) -> CleanupReport {
        self.lifecycle.run_once(now).await
    }

    /// Stops accepting hints, persists what is buffered and stops every background task.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!("Shutting down hints service");
        }

        self.flusher_cancel.cancel();
        let flusher_task = self.flusher_task.lock().take();
        if let Some(task) = flusher_task {
            if let Err(err) = task.await {
                warn!(%err, "Hints flusher did not stop cleanly");
            }
        }

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Hints service stopped");
    }
}

impl Drop for HintsService {
    fn drop(&mut self) {
        self.flusher_cancel.cancel();
        self.cancel.cancel();
    }
}

async fn watch_membership(
    mut events: broadcast::Receiver<ReachabilityEvent>,
    membership: Arc<dyn ClusterMembership>,
    dispatchers: Arc<Dispatchers>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ReachabilityEvent::Up(node)) => {
                dispatchers.notify(node, DispatcherEvent::TargetUp);
            }
            Ok(ReachabilityEvent::Down(node)) => {
                dispatchers.notify(node, DispatcherEvent::TargetDown);
            }
            Ok(ReachabilityEvent::Removed(node)) => match dispatchers.retire(node).await {
                Ok(()) => info!(target = %node, "Retired hints of a removed node"),
                Err(err) => warn!(target = %node, %err, "Cannot retire hints of a removed node"),
            },
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Missed reachability events, resynchronizing dispatchers");
                for target in dispatchers.targets() {
                    let event = if membership.is_reachable(target) {
                        DispatcherEvent::TargetUp
                    } else {
                        DispatcherEvent::TargetDown
                    };
                    dispatchers.notify(target, event);
                }
            }
            Err(RecvError::Closed) => {
                debug!("Reachability events ended");
                break;
            }
        }
    }
}
