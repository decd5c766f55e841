// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use handoff_buffer::{Arena, BufferPool, FlushReceiver, TargetBatch};
use handoff_store::{HintsCatalog, StoreError};
use handoff_types::errors::MaybeRetryableError;
use handoff_types::retries::RetryPolicy;

use crate::dispatcher::Dispatchers;
use crate::metric_definitions::{
    DROP_REASON, DROP_REASON_FLUSH_FAILURE, DROP_REASON_RETIRED, FLUSH_BYTES, HINTS_DROPPED,
    SEGMENTS_FLUSHED,
};

/// Completed once every arena retired before the barrier was sent is on disk.
pub(crate) type FlushBarrier = oneshot::Sender<()>;

/// Single worker that persists retired arenas, one segment per target and arena.
pub(crate) struct Flusher {
    pool: Arc<BufferPool>,
    catalog: Arc<HintsCatalog>,
    dispatchers: Arc<Dispatchers>,
    retry_policy: RetryPolicy,
    flush_interval: Duration,
    arenas: FlushReceiver,
    barriers: mpsc::UnboundedReceiver<FlushBarrier>,
}

impl Flusher {
    pub fn new(
        pool: Arc<BufferPool>,
        catalog: Arc<HintsCatalog>,
        dispatchers: Arc<Dispatchers>,
        retry_policy: RetryPolicy,
        flush_interval: Duration,
        arenas: FlushReceiver,
        barriers: mpsc::UnboundedReceiver<FlushBarrier>,
    ) -> Self {
        Self {
            pool,
            catalog,
            dispatchers,
            retry_policy,
            flush_interval,
            arenas,
            barriers,
        }
    }

    /// Runs until `cancel` fires, then persists whatever is still buffered.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("Hints flusher started");
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.reset();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(arena) = self.arenas.recv() => self.flush_arena(arena).await,
                Some(barrier) = self.barriers.recv() => {
                    self.flush_queued().await;
                    let _ = barrier.send(());
                }
                _ = interval.tick() => self.flush_active(),
            }
        }

        // waits for writers that are still copying into the active arena
        if let Err(err) = self.pool.close().await {
            warn!(%err, "Cannot retire the last arena");
        }
        self.flush_queued().await;
        while let Ok(barrier) = self.barriers.try_recv() {
            let _ = barrier.send(());
        }
        self.arenas.close();
        self.flush_queued().await;
        debug!("Hints flusher stopped");
    }

    fn flush_active(&self) {
        match self.pool.flush_active() {
            Ok(true) => trace!("Retired the active arena on the flush interval"),
            Ok(false) => {}
            Err(err) => warn!(%err, "Cannot retire the active arena"),
        }
    }

    async fn flush_queued(&mut self) {
        while let Ok(arena) = self.arenas.try_recv() {
            self.flush_arena(arena).await;
        }
    }

    async fn flush_arena(&self, arena: Arc<Arena>) {
        arena.wait_drained().await;
        let used = arena.used();
        histogram!(FLUSH_BYTES).record(used as f64);

        let mut segments = 0;
        for batch in arena.target_batches() {
            if self.flush_target(&batch).await {
                segments += 1;
            }
        }
        counter!(SEGMENTS_FLUSHED).increment(segments);

        let released = arena.release_budget();
        debug!(
            arena = %arena.id(),
            records = arena.record_count(),
            bytes = used,
            segments,
            released,
            "Flushed arena"
        );
        self.pool.recycle(arena);
    }

    /// Persists one target's share of an arena. Returns whether a segment was written.
    async fn flush_target(&self, batch: &TargetBatch<'_>) -> bool {
        let target = batch.target;
        let records = batch.frames.len();
        if self.catalog.is_retired(target) {
            trace!(target = %target, records, "Dropping hints of a retired target");
            counter!(HINTS_DROPPED, DROP_REASON => DROP_REASON_RETIRED).increment(records as u64);
            return false;
        }

        let catalog = &self.catalog;
        let frames = &batch.frames[..];
        let max_expires_at = batch.max_expires_at;
        let result = self
            .retry_policy
            .clone()
            .retry_if(
                || async move {
                    let (store, _) = catalog.get_or_create(target).await?;
                    let segment = store
                        .append(frames, records as u32, max_expires_at)
                        .await?;
                    Ok::<_, StoreError>((store, segment))
                },
                |err| {
                    let retry = err.retryable();
                    if retry {
                        warn!(target = %target, %err, "Cannot write hints segment, retrying");
                    }
                    retry
                },
            )
            .await;

        match result {
            Ok((store, segment)) => {
                trace!(target = %target, %segment, records, "Persisted hints");
                self.dispatchers.ensure(store);
                true
            }
            Err(StoreError::Retired(_)) => {
                counter!(HINTS_DROPPED, DROP_REASON => DROP_REASON_RETIRED)
                    .increment(records as u64);
                false
            }
            Err(err) => {
                error!(
                    target = %target,
                    %err,
                    records,
                    bytes = batch.bytes,
                    "Giving up on writing hints segment, the hints are lost"
                );
                counter!(HINTS_DROPPED, DROP_REASON => DROP_REASON_FLUSH_FAILURE)
                    .increment(records as u64);
                false
            }
        }
    }
}
