// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replay of stored hints to recovered targets.
//!
//! Every target store gets exactly one [`Dispatcher`] task. It owns the store's dispatch
//! cursor and moves through these states:
//!
//! ```text
//!            TargetUp / append           caught up, TargetDown,
//!   Idle ------------------------> Draining ---- retryable failure ---> Idle
//!    ^  \                                                                |
//!    |   Pause --> Paused -- Resume --> (Draining if reachable, else Idle)
//!    |
//!    +-- any state -- Retire / fatal failure --> Retired
//! ```

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use handoff_store::{HintsCatalog, RecordPosition, SegmentId, StoreError, TargetStore};
use handoff_types::errors::MaybeRetryableError;
use handoff_types::identifiers::NodeId;
use handoff_types::time::MillisSinceEpoch;

use crate::delivery::HintDelivery;
use crate::membership::ClusterMembership;
use crate::metric_definitions::{
    DISPATCH_FATAL, DROP_REASON, DROP_REASON_FATAL, DROP_REASON_RETIRED, HINTS_DELIVERED,
    HINTS_DROPPED, HINTS_EXPIRED,
};
use crate::throttle::Throttle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum DispatcherState {
    /// Nothing to deliver, or the target is unreachable.
    Idle,
    /// Replaying stored hints to the target.
    Draining,
    /// Dispatch was suspended administratively.
    Paused,
    /// The target is gone for good and its hints were deleted. Terminal.
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatcherEvent {
    TargetUp,
    TargetDown,
    Pause,
    Resume,
    Retire,
}

/// Control and observation of a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    target: NodeId,
    events: mpsc::UnboundedSender<DispatcherEvent>,
    state: watch::Receiver<DispatcherState>,
}

impl DispatcherHandle {
    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Waits until the dispatcher reports `state`, or until it is retired.
    ///
    /// Returns the state that ended the wait.
    pub async fn wait_for_state(&self, state: DispatcherState) -> DispatcherState {
        let mut rx = self.state.clone();
        let result = rx
            .wait_for(|current| *current == state || *current == DispatcherState::Retired)
            .await
            .map(|current| *current);
        // the dispatcher stopped without reaching the state
        result.unwrap_or_else(|_| *rx.borrow())
    }

    pub(crate) fn send(&self, event: DispatcherEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Everything dispatchers share.
pub(crate) struct DispatchContext {
    pub catalog: Arc<HintsCatalog>,
    pub membership: Arc<dyn ClusterMembership>,
    pub delivery: Arc<dyn HintDelivery>,
    pub delivery_timeout: Duration,
    pub retry_delay: Duration,
    pub dispatch_throttle: Option<NonZeroU32>,
}

/// The dispatchers of all targets.
pub(crate) struct Dispatchers {
    ctx: Arc<DispatchContext>,
    handles: DashMap<NodeId, DispatcherHandle>,
    paused: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatchers {
    pub fn new(ctx: Arc<DispatchContext>, tracker: TaskTracker, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            handles: DashMap::new(),
            paused: AtomicBool::new(false),
            tracker,
            cancel,
        }
    }

    /// Returns the dispatcher of the store's target, spawning it if needed.
    pub fn ensure(&self, store: Arc<TargetStore>) -> DispatcherHandle {
        match self.handles.entry(store.target()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let target = store.target();
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let (state_tx, state_rx) = watch::channel(DispatcherState::Idle);
                let dispatcher = Dispatcher {
                    ctx: Arc::clone(&self.ctx),
                    appends: store.subscribe_appends(),
                    store,
                    events: events_rx,
                    state: state_tx,
                    reachable: false,
                    paused: self.paused.load(Ordering::Relaxed),
                    throttle: Throttle::new(self.ctx.dispatch_throttle),
                    cancel: self.cancel.child_token(),
                };
                self.tracker.spawn(dispatcher.run());
                debug!(target = %target, "Started hints dispatcher");

                let handle = DispatcherHandle {
                    target,
                    events: events_tx,
                    state: state_rx,
                };
                entry.insert(handle.clone());
                handle
            }
        }
    }

    pub fn get(&self, target: NodeId) -> Option<DispatcherHandle> {
        self.handles.get(&target).map(|handle| handle.clone())
    }

    pub fn targets(&self) -> Vec<NodeId> {
        self.handles.iter().map(|entry| *entry.key()).collect()
    }

    pub fn notify(&self, target: NodeId, event: DispatcherEvent) -> bool {
        self.get(target).is_some_and(|handle| handle.send(event))
    }

    pub fn pause_all(&self) {
        self.paused.store(true, Ordering::Relaxed);
        self.broadcast(DispatcherEvent::Pause);
    }

    pub fn resume_all(&self) {
        self.paused.store(false, Ordering::Relaxed);
        self.broadcast(DispatcherEvent::Resume);
    }

    fn broadcast(&self, event: DispatcherEvent) {
        for entry in self.handles.iter() {
            entry.send(event);
        }
    }

    /// Retires `target`: its dispatcher stops for good and everything stored for it is
    /// deleted. Hints recorded for it later are dropped.
    pub async fn retire(&self, target: NodeId) -> Result<(), StoreError> {
        match self.get(target) {
            Some(handle)
                if handle.state() != DispatcherState::Retired
                    && handle.send(DispatcherEvent::Retire) =>
            {
                if handle.wait_for_state(DispatcherState::Retired).await
                    == DispatcherState::Retired
                {
                    return Ok(());
                }
                // the dispatcher shut down before handling the event
                self.ctx.catalog.retire(target).await.map(|_| ())
            }
            _ => self.ctx.catalog.retire(target).await.map(|_| ()),
        }
    }
}

enum Drained {
    CaughtUp,
    Interrupted(DispatcherEvent),
    RetryLater,
    Fatal,
    Cancelled,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Dispatcher {
    ctx: Arc<DispatchContext>,
    store: Arc<TargetStore>,
    events: mpsc::UnboundedReceiver<DispatcherEvent>,
    appends: watch::Receiver<SegmentId>,
    state: watch::Sender<DispatcherState>,
    reachable: bool,
    paused: bool,
    throttle: Throttle,
    cancel: CancellationToken,
}

impl Dispatcher {
    fn target(&self) -> NodeId {
        self.store.target()
    }

    async fn run(mut self) {
        let target = self.target();
        self.reachable = self.ctx.membership.is_reachable(target);
        // segments before the cursor were consumed before a crash or restart
        self.discard_before(self.store.cursor().segment).await;
        self.publish_idle();
        trace!(target = %target, reachable = self.reachable, "Hints dispatcher running");

        let mut pending = true;
        let mut retry_at: Option<Instant> = None;
        loop {
            if pending && self.reachable && !self.paused && retry_at.is_none() {
                pending = false;
                match self.drain().await {
                    Drained::CaughtUp => self.publish_idle(),
                    Drained::Interrupted(event) => {
                        pending = true;
                        if let Flow::Stop = self.on_event(event, &mut retry_at).await {
                            return;
                        }
                    }
                    Drained::RetryLater => {
                        pending = true;
                        retry_at = Some(Instant::now() + self.ctx.retry_delay);
                        self.publish_idle();
                    }
                    Drained::Fatal => {
                        self.retire(DROP_REASON_FATAL).await;
                        return;
                    }
                    Drained::Cancelled => break,
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    pending = true;
                    if let Flow::Stop = self.on_event(event, &mut retry_at).await {
                        return;
                    }
                }
                Ok(()) = self.appends.changed() => {
                    pending = true;
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                    self.reachable = self.ctx.membership.is_reachable(target);
                    debug!(target = %target, reachable = self.reachable, "Retry delay elapsed");
                }
            }
        }

        self.persist_cursor().await;
        debug!(target = %target, "Hints dispatcher stopped");
    }

    async fn on_event(&mut self, event: DispatcherEvent, retry_at: &mut Option<Instant>) -> Flow {
        let target = self.target();
        match event {
            DispatcherEvent::TargetUp => {
                self.reachable = true;
                *retry_at = None;
                debug!(target = %target, "Target is reachable");
            }
            DispatcherEvent::TargetDown => {
                self.reachable = false;
                self.publish_idle();
                debug!(target = %target, "Target is unreachable");
            }
            DispatcherEvent::Pause => {
                self.paused = true;
                self.publish_idle();
            }
            DispatcherEvent::Resume => {
                self.paused = false;
                self.publish_idle();
            }
            DispatcherEvent::Retire => {
                self.retire(DROP_REASON_RETIRED).await;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Delivers stored hints until caught up or interrupted. Events are only looked at
    /// between records, so the cursor always rests on a record boundary.
    async fn drain(&mut self) -> Drained {
        let target = self.target();
        self.appends.mark_unchanged();
        self.publish(DispatcherState::Draining);
        info!(
            target = %target,
            pending = self.store.pending_count(),
            "Dispatching stored hints"
        );

        let mut reader = self.store.read_from(self.store.cursor());
        loop {
            if self.cancel.is_cancelled() {
                self.persist_cursor().await;
                return Drained::Cancelled;
            }
            if let Ok(event) = self.events.try_recv() {
                self.persist_cursor().await;
                return Drained::Interrupted(event);
            }

            let (position, hint) = match reader.next().await {
                Ok(Some(next)) => next,
                Ok(None) => {
                    let position = reader.position();
                    if position > self.store.cursor() {
                        self.store.set_cursor(position);
                    }
                    self.discard_before(position.segment).await;
                    self.persist_cursor().await;
                    debug!(target = %target, "Caught up with stored hints");
                    return Drained::CaughtUp;
                }
                Err(err) => {
                    warn!(target = %target, %err, "Cannot read stored hints, will retry");
                    self.persist_cursor().await;
                    return Drained::RetryLater;
                }
            };

            if hint.is_expired(MillisSinceEpoch::now()) {
                trace!(target = %target, segment = %position.segment, "Skipping expired hint");
                counter!(HINTS_EXPIRED).increment(1);
                self.advance(position).await;
                continue;
            }

            let payload = hint.into_payload();
            let ctx = Arc::clone(&self.ctx);
            let throttle = &self.throttle;
            let delivery = async {
                throttle.acquire(payload.len()).await;
                tokio::time::timeout(ctx.delivery_timeout, ctx.delivery.deliver(target, payload))
                    .await
            };
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                outcome = delivery => Some(outcome),
            };
            let Some(outcome) = outcome else {
                self.persist_cursor().await;
                return Drained::Cancelled;
            };

            match outcome {
                Ok(Ok(())) => {
                    counter!(HINTS_DELIVERED).increment(1);
                    self.advance(position).await;
                }
                Ok(Err(err)) if err.retryable() => {
                    warn!(target = %target, %err, "Hint delivery failed, pausing dispatch");
                    self.persist_cursor().await;
                    return Drained::RetryLater;
                }
                Ok(Err(err)) => {
                    error!(
                        target = %target,
                        %err,
                        "Target rejected a hint permanently, retiring its dispatcher"
                    );
                    counter!(DISPATCH_FATAL).increment(1);
                    return Drained::Fatal;
                }
                Err(_elapsed) => {
                    warn!(
                        target = %target,
                        timeout = ?self.ctx.delivery_timeout,
                        "Hint delivery timed out, pausing dispatch"
                    );
                    self.persist_cursor().await;
                    return Drained::RetryLater;
                }
            }
        }
    }

    async fn advance(&mut self, position: RecordPosition) {
        self.store.set_cursor(position.next);
        if position.completes_segment() {
            if let Err(err) = self.store.discard_up_to(position.segment).await {
                warn!(target = %self.target(), segment = %position.segment, %err, "Cannot delete delivered segment");
            }
            self.persist_cursor().await;
        }
    }

    async fn discard_before(&self, segment: SegmentId) {
        if segment <= SegmentId::OLDEST {
            return;
        }
        let up_to = SegmentId::new(segment.as_u64() - 1);
        if let Err(err) = self.store.discard_up_to(up_to).await {
            warn!(target = %self.target(), %err, "Cannot delete consumed segments");
        }
    }

    async fn persist_cursor(&self) {
        if let Err(err) = self.store.persist_cursor().await {
            warn!(target = %self.target(), %err, "Cannot persist dispatch cursor");
        }
    }

    async fn retire(&mut self, reason: &'static str) {
        let target = self.target();
        let pending = self.store.pending_count();
        if let Err(err) = self.ctx.catalog.retire(target).await {
            warn!(target = %target, %err, "Cannot delete the hints of a retired target");
        }
        if pending > 0 {
            counter!(HINTS_DROPPED, DROP_REASON => reason).increment(pending);
        }
        self.publish(DispatcherState::Retired);
        info!(target = %target, dropped = pending, reason, "Retired hints dispatcher");
    }

    fn publish_idle(&self) {
        if self.paused {
            self.publish(DispatcherState::Paused);
        } else {
            self.publish(DispatcherState::Idle);
        }
    }

    fn publish(&self, state: DispatcherState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                trace!(target = %self.store.target(), from = %current, to = %state, "Dispatcher state changed");
                *current = state;
                true
            }
        });
    }
}
