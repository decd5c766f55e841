// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable, per-target storage of hints.
//!
//! Every target owns a directory named after its [`NodeId`](handoff_types::identifiers::NodeId)
//! holding immutable, checksummed segment files and the persisted dispatch cursor:
//!
//! ```text
//! hints-dir/
//!   <node-uuid>/
//!     00000000000000000001.segment
//!     00000000000000000002.segment
//!     dispatch.cursor
//! ```

mod catalog;
mod cursor;
mod error;
mod reader;
mod segment;
mod target_store;

pub use catalog::HintsCatalog;
pub use cursor::DispatchCursor;
pub use error::StoreError;
pub use reader::{HintReader, RecordPosition};
pub use segment::{SegmentHeader, SegmentId, SegmentMeta};
pub use target_store::TargetStore;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
