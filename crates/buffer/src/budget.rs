// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Byte budget bounding the amount of hint data that was accepted but is not yet durable.
//!
//! Writers reserve the encoded size of a hint before copying it into an arena. The
//! reservation travels with the hint into the arena and is only returned once the arena
//! has been appended to the store, so the budget covers both the active arena and the
//! arenas waiting to be flushed.

use std::fmt;
use std::num::NonZeroUsize;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytesize::ByteSize;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Tracks and limits buffered bytes.
///
/// Clones share the same limit. A budget without a limit hands out reservations without
/// tracking them.
#[derive(Debug, Clone, Default)]
pub struct MemoryBudget {
    shared: Option<Arc<Shared>>,
}

#[derive(Debug)]
struct Shared {
    limit: usize,
    in_use: AtomicUsize,
    released: Notify,
}

impl MemoryBudget {
    pub const fn unlimited() -> Self {
        Self { shared: None }
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        let shared = Shared {
            limit: capacity.get(),
            in_use: AtomicUsize::new(0),
            released: Notify::new(),
        };
        Self {
            shared: Some(Arc::new(shared)),
        }
    }

    /// A `capacity` of zero means unlimited.
    pub fn new(capacity: usize) -> Self {
        match NonZeroUsize::new(capacity) {
            Some(capacity) => Self::with_capacity(capacity),
            None => Self::unlimited(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.shared.is_none()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.as_deref().map(|shared| shared.limit)
    }

    pub fn available(&self) -> usize {
        self.shared.as_deref().map_or(usize::MAX, |shared| {
            shared
                .limit
                .saturating_sub(shared.in_use.load(Ordering::Relaxed))
        })
    }

    pub fn reserved(&self) -> usize {
        self.shared
            .as_deref()
            .map_or(0, |shared| shared.in_use.load(Ordering::Relaxed))
    }

    /// Reserves `size` bytes if they are available right now.
    ///
    /// While nothing is reserved any size is granted, so a request larger than the
    /// capacity cannot wait forever.
    pub fn try_reserve(&self, size: usize) -> Option<MemoryReservation> {
        if let Some(shared) = self.shared.as_deref() {
            let granted = shared
                .in_use
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |in_use| {
                    in_use
                        .checked_add(size)
                        .filter(|after| *after <= shared.limit || in_use == 0)
                });
            granted.ok()?;
        }
        Some(self.reattach(size))
    }

    /// Reserves `size` bytes, waiting for other reservations to be released if needed.
    pub async fn reserve(&self, size: usize) -> MemoryReservation {
        let Some(shared) = self.shared.as_deref() else {
            return self.reattach(size);
        };

        let mut released = pin!(shared.released.notified());
        loop {
            // registered before checking so a release in between still wakes us
            released.as_mut().enable();
            if let Some(reservation) = self.try_reserve(size) {
                trace!(size = %ByteSize(size as u64), "Reserved hint buffer budget");
                return reservation;
            }
            debug!(
                size = %ByteSize(size as u64),
                in_use = %ByteSize(self.reserved() as u64),
                "Hint buffer budget exhausted, waiting"
            );
            released.as_mut().await;
            released.set(shared.released.notified());
        }
    }

    pub fn empty_reservation(&self) -> MemoryReservation {
        self.reattach(0)
    }

    /// Takes back ownership of `size` bytes that were [detached](MemoryReservation::detach)
    /// from a reservation of this budget. The bytes stay accounted for.
    pub fn reattach(&self, size: usize) -> MemoryReservation {
        MemoryReservation {
            budget: self.clone(),
            size,
        }
    }

    fn give_back(&self, size: usize) {
        if size == 0 {
            return;
        }
        if let Some(shared) = self.shared.as_deref() {
            shared.in_use.fetch_sub(size, Ordering::Relaxed);
            shared.released.notify_waiters();
        }
    }

    fn shares_limit_with(&self, other: &MemoryBudget) -> bool {
        match (&self.shared, &other.shared) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (a, b) => a.is_none() && b.is_none(),
        }
    }
}

/// Bytes held from a [`MemoryBudget`]. Dropping it hands them back.
#[must_use]
pub struct MemoryReservation {
    budget: MemoryBudget,
    size: usize,
}

impl MemoryReservation {
    /// An empty reservation that belongs to no budget.
    pub fn unlinked() -> Self {
        MemoryBudget::unlimited().empty_reservation()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// Hands all bytes back now. Returns how many that were.
    pub fn release(&mut self) -> usize {
        let size = std::mem::take(&mut self.size);
        self.budget.give_back(size);
        size
    }

    /// Takes over the bytes of `other`, which must come from the same budget.
    pub fn merge(&mut self, mut other: MemoryReservation) {
        debug_assert!(
            self.budget.shares_limit_with(&other.budget),
            "cannot merge reservations of different budgets"
        );
        self.size += std::mem::take(&mut other.size);
    }

    /// Forgets the reservation while keeping its bytes accounted for. They must come back
    /// through [`MemoryBudget::reattach`].
    pub fn detach(mut self) -> usize {
        std::mem::take(&mut self.size)
    }
}

impl fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("size", &self.size)
            .field("limit", &self.budget.capacity())
            .finish()
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.release();
    }
}

static_assertions::assert_impl_all!(MemoryBudget: Send, Sync);
static_assertions::assert_impl_all!(MemoryReservation: Send, Sync);
