// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace};

use handoff_types::hint::HintRecord;

use crate::arena::{Arena, ArenaId};
use crate::budget::{MemoryBudget, MemoryReservation};

pub type FlushSender = mpsc::UnboundedSender<Arc<Arena>>;
pub type FlushReceiver = mpsc::UnboundedReceiver<Arc<Arena>>;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("hint of {size} bytes does not fit into an arena of {limit} bytes")]
    HintTooLarge { size: usize, limit: usize },
    #[error("hint has no targets")]
    NoTargets,
    #[error("hint buffer is shut down")]
    Closed,
}

/// Holds the arena that writers currently copy hints into, and at most one spare.
///
/// When the active arena cannot fit a hint, the writer that notices swaps in the spare (or a
/// freshly allocated arena) and hands the full one to the flusher through the flush channel.
/// Exactly one writer wins that swap; everybody else simply retries on the new active arena.
pub struct BufferPool {
    arena_size: NonZeroUsize,
    budget: MemoryBudget,
    active: ArcSwap<Arena>,
    reserve: ArcSwapOption<Arena>,
    next_id: AtomicU64,
    flush_tx: FlushSender,
    closed: AtomicBool,
    writers: AtomicUsize,
    writers_done: Notify,
}

impl BufferPool {
    pub fn new(arena_size: NonZeroUsize, budget: MemoryBudget) -> (Self, FlushReceiver) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let first = Arena::new(ArenaId::new(0), arena_size.get(), budget.clone());
        let pool = Self {
            arena_size,
            budget,
            active: ArcSwap::from_pointee(first),
            reserve: ArcSwapOption::empty(),
            next_id: AtomicU64::new(1),
            flush_tx,
            closed: AtomicBool::new(false),
            writers: AtomicUsize::new(0),
            writers_done: Notify::new(),
        };
        (pool, flush_rx)
    }

    pub fn arena_size(&self) -> NonZeroUsize {
        self.arena_size
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn active_id(&self) -> ArenaId {
        self.active.load().id()
    }

    pub fn has_reserve(&self) -> bool {
        self.reserve.load().is_some()
    }

    /// Copies `hint` into the active arena, switching arenas as often as needed.
    ///
    /// The reservation must cover [`HintRecord::encoded_len`]; it stays accounted for until
    /// the arena holding the hint has been flushed.
    pub fn write(
        &self,
        hint: &HintRecord,
        reservation: MemoryReservation,
    ) -> Result<ArenaId, WriteError> {
        let size = hint.encoded_len();
        if size > self.arena_size.get() {
            return Err(WriteError::HintTooLarge {
                size,
                limit: self.arena_size.get(),
            });
        }
        if hint.targets().is_empty() {
            return Err(WriteError::NoTargets);
        }
        if self.flush_tx.is_closed() {
            return Err(WriteError::Closed);
        }
        let _writer = self.enter()?;

        loop {
            let arena = self.active.load_full();
            if let Some(mut allocation) = arena.allocate(size) {
                hint.encode_into(allocation.buffer());
                allocation.commit(hint.targets().iter().copied(), hint.expires_at(), reservation);
                return Ok(arena.id());
            }
            self.switch(&arena)?;
        }
    }

    /// Hands the active arena to the flusher if it holds anything.
    ///
    /// Returns whether an arena was retired by this call.
    pub fn flush_active(&self) -> Result<bool, WriteError> {
        let current = self.active.load_full();
        if current.used() == 0 {
            return Ok(false);
        }
        self.switch(&current)
    }

    /// Refuses further writes, waits for the writes already running and hands the active
    /// arena to the flusher. Returns whether an arena was retired.
    pub async fn close(&self) -> Result<bool, WriteError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut done = pin!(self.writers_done.notified());
        loop {
            done.as_mut().enable();
            if self.writers.load(Ordering::SeqCst) == 0 {
                break;
            }
            done.as_mut().await;
            done.set(self.writers_done.notified());
        }
        self.flush_active()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enter(&self) -> Result<WriterGuard<'_>, WriteError> {
        self.writers.fetch_add(1, Ordering::SeqCst);
        let guard = WriterGuard { pool: self };
        // either close() waits for this writer or the writer sees the close
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::Closed);
        }
        Ok(guard)
    }

    /// Offers a flushed arena for reuse as the spare.
    pub fn recycle(&self, arena: Arc<Arena>) {
        if arena.capacity() != self.arena_size.get() {
            return;
        }
        let id = self.next_arena_id();
        match Arena::recycle(arena, id) {
            Ok(fresh) => {
                if self.offer_reserve(Arc::new(fresh)) {
                    trace!("Recycled flushed arena as {id}");
                }
            }
            Err(arena) => {
                debug!("Cannot recycle {} while it is still referenced", arena.id());
            }
        }
    }

    fn switch(&self, current: &Arc<Arena>) -> Result<bool, WriteError> {
        let next = self
            .reserve
            .swap(None)
            .unwrap_or_else(|| Arc::new(self.new_arena()));
        let next_id = next.id();

        let previous = self.active.compare_and_swap(current, Arc::clone(&next));
        if !Arc::ptr_eq(&previous, current) {
            // another writer already replaced `current`
            self.offer_reserve(next);
            return Ok(false);
        }

        current.close();
        trace!(
            "Retiring {} ({} records, {} bytes), {next_id} is now active",
            current.id(),
            current.record_count(),
            current.used(),
        );
        self.flush_tx
            .send(Arc::clone(current))
            .map_err(|_| WriteError::Closed)?;
        Ok(true)
    }

    fn offer_reserve(&self, arena: Arc<Arena>) -> bool {
        let previous = self
            .reserve
            .compare_and_swap(&None::<Arc<Arena>>, Some(arena));
        previous.is_none()
    }

    fn new_arena(&self) -> Arena {
        Arena::new(
            self.next_arena_id(),
            self.arena_size.get(),
            self.budget.clone(),
        )
    }

    fn next_arena_id(&self) -> ArenaId {
        ArenaId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

struct WriterGuard<'a> {
    pool: &'a BufferPool,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        let pool = self.pool;
        if pool.writers.fetch_sub(1, Ordering::SeqCst) == 1 && pool.closed.load(Ordering::SeqCst)
        {
            pool.writers_done.notify_waiters();
        }
    }
}
