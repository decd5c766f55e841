// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Range;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;

use handoff_types::identifiers::NodeId;
use handoff_types::time::MillisSinceEpoch;

use crate::budget::{MemoryBudget, MemoryReservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("arena-{_0}")]
pub struct ArenaId(u64);

impl ArenaId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct TargetRecords {
    frames: Vec<Range<usize>>,
    bytes: usize,
    max_expires_at: MillisSinceEpoch,
}

/// A fixed-capacity, append-only region that many writers fill concurrently.
///
/// Space is claimed with a single atomic bump of the write offset, so allocations never
/// overlap and the offset never exceeds the capacity. Once [closed](Self::close), no new
/// allocation succeeds and the flusher waits for in-flight writers to
/// [drain](Self::wait_drained) before reading the committed frames.
pub struct Arena {
    id: ArenaId,
    memory: Box<[UnsafeCell<u8>]>,
    write_offset: AtomicUsize,
    in_flight: AtomicUsize,
    closing: AtomicBool,
    drained: Notify,
    records: AtomicUsize,
    index: DashMap<NodeId, TargetRecords>,
    // bytes detached from writers' reservations, handed back to the budget after flush
    weight: AtomicUsize,
    budget: MemoryBudget,
}

// Safety: the memory is only written through `Allocation`s, which cover disjoint ranges, and
// only read through `target_batches` once no allocation is outstanding and none can be made.
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(id: ArenaId, capacity: usize, budget: MemoryBudget) -> Self {
        let memory = vec![0u8; capacity].into_boxed_slice();
        // UnsafeCell<u8> has the same in-memory representation as u8
        let memory = unsafe { Box::from_raw(Box::into_raw(memory) as *mut [UnsafeCell<u8>]) };
        Self::with_memory(id, memory, budget)
    }

    fn with_memory(id: ArenaId, memory: Box<[UnsafeCell<u8>]>, budget: MemoryBudget) -> Self {
        Self {
            id,
            memory,
            write_offset: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            drained: Notify::new(),
            records: AtomicUsize::new(0),
            index: DashMap::new(),
            weight: AtomicUsize::new(0),
            budget,
        }
    }

    pub fn id(&self) -> ArenaId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes claimed so far, including allocations that were never committed.
    pub fn used(&self) -> usize {
        self.write_offset.load(Ordering::Acquire)
    }

    pub fn record_count(&self) -> usize {
        self.records.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.is_closing() && self.in_flight() == 0
    }

    /// Budget bytes held by the committed records.
    pub fn weight(&self) -> usize {
        self.weight.load(Ordering::Acquire)
    }

    /// Claims `size` contiguous bytes.
    ///
    /// Returns `None` if the arena is closing or does not have `size` bytes left. A failed
    /// allocation leaves the write offset untouched.
    pub fn allocate(&self, size: usize) -> Option<Allocation<'_>> {
        debug_assert!(size > 0);
        if self.closing.load(Ordering::Acquire) {
            return None;
        }

        // registered before re-checking `closing` so a concurrent close either sees this
        // writer as in flight or this writer sees the close
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closing.load(Ordering::SeqCst) {
            self.leave();
            return None;
        }

        let capacity = self.capacity();
        match self
            .write_offset
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |offset| {
                offset.checked_add(size).filter(|end| *end <= capacity)
            }) {
            Ok(offset) => Some(Allocation {
                arena: self,
                range: offset..offset + size,
            }),
            Err(_) => {
                self.leave();
                None
            }
        }
    }

    /// Stops accepting allocations. Returns `true` if this call closed the arena.
    pub fn close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    /// Waits until every outstanding allocation was committed or abandoned.
    ///
    /// Must only be awaited after [`close`](Self::close), otherwise new writers may keep
    /// arriving.
    pub async fn wait_drained(&self) {
        debug_assert!(self.is_closing());
        let mut notified = pin!(self.drained.notified());
        loop {
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.as_mut().await;
            notified.set(self.drained.notified());
        }
    }

    fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && self.closing.load(Ordering::SeqCst)
        {
            self.drained.notify_waiters();
        }
    }

    /// The committed frames grouped by target, in commit order per target.
    ///
    /// # Panics
    /// If the arena is not [drained](Self::is_drained).
    pub fn target_batches(&self) -> Vec<TargetBatch<'_>> {
        assert!(
            self.is_drained(),
            "{} must be closed and drained before it is read",
            self.id
        );
        let mut batches: Vec<_> = self
            .index
            .iter()
            .map(|entry| TargetBatch {
                target: *entry.key(),
                frames: self.slices(&entry.frames),
                bytes: entry.bytes,
                max_expires_at: entry.max_expires_at,
            })
            .collect();
        batches.sort_by_key(|batch| batch.target);
        batches
    }

    /// Targets with at least one committed record, in ascending order.
    pub fn targets(&self) -> Vec<NodeId> {
        let mut targets: Vec<_> = self.index.iter().map(|entry| *entry.key()).collect();
        targets.sort_unstable();
        targets
    }

    /// The frames committed for `target`, in commit order. Empty if there are none.
    ///
    /// # Panics
    /// If the arena is not closed and drained.
    pub fn records_for(&self, target: NodeId) -> Vec<&[u8]> {
        assert!(
            self.is_drained(),
            "{} must be closed and drained before it is read",
            self.id
        );
        self.index
            .get(&target)
            .map(|records| self.slices(&records.frames))
            .unwrap_or_default()
    }

    fn slices(&self, ranges: &[Range<usize>]) -> Vec<&[u8]> {
        let base = UnsafeCell::raw_get(self.memory.as_ptr());
        ranges
            .iter()
            // Safety: callers checked that the arena is drained, so committed ranges are
            // within the memory and nobody writes to them anymore
            .map(|range| unsafe {
                std::slice::from_raw_parts(base.add(range.start).cast_const(), range.len())
            })
            .collect()
    }

    /// Returns the records' budget bytes. Safe to call more than once.
    pub fn release_budget(&self) -> usize {
        let weight = self.weight.swap(0, Ordering::AcqRel);
        if weight > 0 {
            drop(self.budget.reattach(weight));
        }
        weight
    }

    /// Turns a flushed arena into an empty one with the same memory.
    ///
    /// Fails, giving the arena back, while someone else still holds a reference to it.
    pub fn recycle(arena: Arc<Self>, id: ArenaId) -> Result<Self, Arc<Self>> {
        let mut arena = Arc::try_unwrap(arena)?;
        let memory = std::mem::take(&mut arena.memory);
        let budget = arena.budget.clone();
        drop(arena);
        Ok(Self::with_memory(id, memory, budget))
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release_budget();
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("records", &self.record_count())
            .field("in_flight", &self.in_flight())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Exclusive access to a claimed range of an [`Arena`].
///
/// Dropping it without [committing](Self::commit) abandons the range; its bytes become dead
/// space that is never read.
#[must_use]
pub struct Allocation<'a> {
    arena: &'a Arena,
    range: Range<usize>,
}

impl Allocation<'_> {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.range.start
    }

    pub fn buffer(&mut self) -> &mut [u8] {
        let base = UnsafeCell::raw_get(self.arena.memory.as_ptr());
        // Safety: the range was claimed by a single bump of the write offset, no other
        // allocation overlaps it and readers wait for this allocation to be dropped
        unsafe { std::slice::from_raw_parts_mut(base.add(self.range.start), self.range.len()) }
    }

    /// Makes the written frame visible to the flusher for every target.
    ///
    /// The reservation's bytes stay accounted for until the arena
    /// [releases its budget](Arena::release_budget).
    pub fn commit(
        self,
        targets: impl IntoIterator<Item = NodeId>,
        expires_at: MillisSinceEpoch,
        reservation: MemoryReservation,
    ) {
        for target in targets {
            let mut records = self.arena.index.entry(target).or_default();
            records.frames.push(self.range.clone());
            records.bytes += self.range.len();
            records.max_expires_at = records.max_expires_at.max(expires_at);
        }
        self.arena
            .weight
            .fetch_add(reservation.detach(), Ordering::AcqRel);
        self.arena.records.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for Allocation<'_> {
    fn drop(&mut self) {
        self.arena.leave();
    }
}

/// Frames of one target read from a drained arena.
#[derive(Debug)]
pub struct TargetBatch<'a> {
    pub target: NodeId,
    pub frames: Vec<&'a [u8]>,
    pub bytes: usize,
    pub max_expires_at: MillisSinceEpoch,
}

static_assertions::assert_impl_all!(Arena: Send, Sync);

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use bytes::Bytes;
    use googletest::prelude::*;
    use test_log::test;

    use handoff_types::hint::HintRecord;

    use super::*;

    fn hint(target: u128, payload: &'static [u8]) -> HintRecord {
        HintRecord::new(
            [NodeId::from_u128(target)],
            Bytes::from_static(payload),
            MillisSinceEpoch::new(1_000),
            60,
        )
    }

    fn write(arena: &Arena, hint: &HintRecord) -> bool {
        let Some(mut allocation) = arena.allocate(hint.encoded_len()) else {
            return false;
        };
        hint.encode_into(allocation.buffer());
        allocation.commit(
            hint.targets().iter().copied(),
            hint.expires_at(),
            MemoryReservation::unlinked(),
        );
        true
    }

    #[test]
    fn allocations_never_exceed_capacity() {
        let arena = Arena::new(ArenaId::new(1), 100, MemoryBudget::unlimited());
        let first = arena.allocate(60).unwrap();
        assert_that!(first.offset(), eq(0));
        assert!(arena.allocate(41).is_none());
        // a failed allocation does not move the offset
        assert_that!(arena.used(), eq(60));
        let second = arena.allocate(40).unwrap();
        assert_that!(second.offset(), eq(60));
        assert!(arena.allocate(1).is_none());
        assert_that!(arena.in_flight(), eq(2));
        drop(first);
        drop(second);
        assert_that!(arena.in_flight(), eq(0));
    }

    #[test]
    fn closed_arena_rejects_allocations() {
        let arena = Arena::new(ArenaId::new(1), 100, MemoryBudget::unlimited());
        assert!(arena.close());
        assert!(!arena.close());
        assert!(arena.allocate(1).is_none());
        assert_that!(arena.in_flight(), eq(0));
        assert!(arena.is_drained());
    }

    #[test]
    fn abandoned_allocation_is_not_indexed() {
        let arena = Arena::new(ArenaId::new(1), 1024, MemoryBudget::unlimited());
        drop(arena.allocate(10).unwrap());
        assert!(write(&arena, &hint(1, b"kept")));
        arena.close();

        let batches = arena.target_batches();
        assert_that!(batches.len(), eq(1));
        assert_that!(batches[0].frames.len(), eq(1));
        assert_that!(arena.record_count(), eq(1));
    }

    #[test]
    fn groups_frames_by_target_in_commit_order() {
        let arena = Arena::new(ArenaId::new(1), 4096, MemoryBudget::unlimited());
        let a1 = hint(1, b"a1");
        let b1 = hint(2, b"b1");
        let a2 = hint(1, b"a2");
        let both = HintRecord::new(
            [NodeId::from_u128(1), NodeId::from_u128(2)],
            Bytes::from_static(b"both"),
            MillisSinceEpoch::new(5_000),
            60,
        );
        for h in [&a1, &b1, &a2, &both] {
            assert!(write(&arena, h));
        }
        arena.close();

        let batches = arena.target_batches();
        assert_that!(batches.len(), eq(2));
        let decode = |frame: &[u8]| HintRecord::decode(&mut Bytes::copy_from_slice(frame)).unwrap();

        let first = &batches[0];
        assert_that!(first.target, eq(NodeId::from_u128(1)));
        let payloads: Vec<_> = first.frames.iter().map(|f| decode(*f).into_payload()).collect();
        assert_eq!(vec!["a1", "a2", "both"], payloads);
        assert_that!(first.max_expires_at, eq(both.expires_at()));

        let second = &batches[1];
        assert_that!(second.frames.len(), eq(2));
        assert_that!(second.bytes, eq(b1.encoded_len() + both.encoded_len()));
        // a multi-target hint is counted once
        assert_that!(arena.record_count(), eq(4));

        assert_eq!(
            vec![NodeId::from_u128(1), NodeId::from_u128(2)],
            arena.targets()
        );
        assert_eq!(second.frames, arena.records_for(NodeId::from_u128(2)));
        assert!(arena.records_for(NodeId::from_u128(3)).is_empty());
    }

    #[test]
    fn budget_is_returned_once_on_release() {
        let budget = MemoryBudget::with_capacity(NonZeroUsize::new(1000).unwrap());
        let arena = Arena::new(ArenaId::new(1), 1000, budget.clone());
        let record = hint(1, b"payload");

        let mut allocation = arena.allocate(record.encoded_len()).unwrap();
        record.encode_into(allocation.buffer());
        allocation.commit(
            [NodeId::from_u128(1)],
            record.expires_at(),
            budget.try_reserve(record.encoded_len()).unwrap(),
        );
        assert_that!(budget.reserved(), eq(record.encoded_len()));
        assert_that!(arena.weight(), eq(record.encoded_len()));

        assert_that!(arena.release_budget(), eq(record.encoded_len()));
        assert_that!(arena.release_budget(), eq(0));
        assert_that!(budget.reserved(), eq(0));
    }

    #[test]
    fn dropping_an_unflushed_arena_returns_its_budget() {
        let budget = MemoryBudget::with_capacity(NonZeroUsize::new(1000).unwrap());
        let arena = Arena::new(ArenaId::new(1), 1000, budget.clone());
        arena.allocate(10).unwrap().commit(
            [NodeId::from_u128(1)],
            MillisSinceEpoch::MAX,
            budget.try_reserve(10).unwrap(),
        );
        drop(arena);
        assert_that!(budget.reserved(), eq(0));
    }

    #[test]
    fn recycle_requires_sole_ownership() {
        let arena = Arc::new(Arena::new(ArenaId::new(1), 64, MemoryBudget::unlimited()));
        drop(arena.allocate(64).unwrap());
        arena.close();

        let other = Arc::clone(&arena);
        let arena = Arena::recycle(arena, ArenaId::new(2)).unwrap_err();
        drop(other);

        let fresh = Arena::recycle(arena, ArenaId::new(2)).unwrap();
        assert_that!(fresh.id(), eq(ArenaId::new(2)));
        assert_that!(fresh.capacity(), eq(64));
        assert_that!(fresh.used(), eq(0));
        assert!(!fresh.is_closing());
    }

    #[test(tokio::test(start_paused = true))]
    async fn wait_drained_waits_for_in_flight_writers() {
        let arena = Arc::new(Arena::new(ArenaId::new(1), 1024, MemoryBudget::unlimited()));
        let (claimed_tx, claimed_rx) = tokio::sync::oneshot::channel();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let writer = std::thread::spawn({
            let arena = Arc::clone(&arena);
            move || {
                let allocation = arena.allocate(16).unwrap();
                claimed_tx.send(()).unwrap();
                let _ = finish_rx.blocking_recv();
                drop(allocation);
            }
        });

        claimed_rx.await.unwrap();
        arena.close();
        let drained = tokio::spawn({
            let arena = Arc::clone(&arena);
            async move { arena.wait_drained().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!drained.is_finished());

        finish_tx.send(()).unwrap();
        drained.await.unwrap();
        writer.join().unwrap();
        assert!(arena.is_drained());
    }

    #[test]
    fn concurrent_writers_get_disjoint_ranges() {
        let arena = Arc::new(Arena::new(ArenaId::new(1), 64 * 1024, MemoryBudget::unlimited()));
        let threads: Vec<_> = (0..8u128)
            .map(|t| {
                let arena = Arc::clone(&arena);
                std::thread::spawn(move || {
                    let mut written = 0;
                    for _ in 0..1000 {
                        if write(&arena, &hint(t, b"0123456789")) {
                            written += 1;
                        }
                    }
                    written
                })
            })
            .collect();
        let written: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        arena.close();

        assert!(arena.used() <= arena.capacity());
        assert_that!(arena.record_count(), eq(written));
        let decoded: usize = arena
            .target_batches()
            .iter()
            .flat_map(|batch| batch.frames.iter())
            .map(|frame| {
                HintRecord::decode(&mut Bytes::copy_from_slice(frame)).unwrap();
                1
            })
            .sum();
        assert_that!(decoded, eq(written));
    }
}
