// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory staging of hints.
//!
//! This crate provides:
//! - [`Arena`]: a fixed-capacity, append-only memory region supporting concurrent allocations
//! - [`BufferPool`]: the active arena plus one spare, swapping them when the active one fills up
//! - [`MemoryBudget`]: a byte budget bounding how much hint data can be buffered at once

mod arena;
mod budget;
mod buffer_pool;

pub use arena::{Allocation, Arena, ArenaId, TargetBatch};
pub use budget::{MemoryBudget, MemoryReservation};
pub use buffer_pool::{BufferPool, FlushReceiver, FlushSender, WriteError};
