// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{Unit, describe_counter, describe_histogram};

pub(crate) const HINTS_CREATED: &str = "handoff.hints.created";
pub(crate) const HINTS_DROPPED: &str = "handoff.hints.dropped";
pub(crate) const HINTS_DELIVERED: &str = "handoff.hints.delivered";
pub(crate) const HINTS_EXPIRED: &str = "handoff.hints.expired";
pub(crate) const SEGMENTS_FLUSHED: &str = "handoff.segments.flushed";
pub(crate) const SEGMENTS_CORRUPTED: &str = "handoff.segments.corrupted";
pub(crate) const DISPATCH_FATAL: &str = "handoff.dispatch.fatal";
pub(crate) const FLUSH_BYTES: &str = "handoff.flush.bytes";

pub(crate) const DROP_REASON: &str = "reason";
pub(crate) const DROP_REASON_BACKPRESSURE: &str = "backpressure";
pub(crate) const DROP_REASON_FLUSH_FAILURE: &str = "flush_failure";
pub(crate) const DROP_REASON_RETIRED: &str = "retired";
pub(crate) const DROP_REASON_DISK_QUOTA: &str = "disk_quota";
pub(crate) const DROP_REASON_FATAL: &str = "fatal";

pub(crate) fn describe_metrics() {
    describe_counter!(
        HINTS_CREATED,
        Unit::Count,
        "Number of hints accepted into the buffer"
    );
    describe_counter!(
        HINTS_DROPPED,
        Unit::Count,
        "Number of hints lost before delivery, labeled by reason"
    );
    describe_counter!(
        HINTS_DELIVERED,
        Unit::Count,
        "Number of hints acknowledged by their target"
    );
    describe_counter!(
        HINTS_EXPIRED,
        Unit::Count,
        "Number of hints skipped or pruned because their time to live passed"
    );
    describe_counter!(
        SEGMENTS_FLUSHED,
        Unit::Count,
        "Number of segments written to the hints store"
    );
    describe_counter!(
        SEGMENTS_CORRUPTED,
        Unit::Count,
        "Number of segments found invalid and deleted during recovery"
    );
    describe_counter!(
        DISPATCH_FATAL,
        Unit::Count,
        "Number of dispatchers retired after a fatal delivery failure"
    );
    describe_histogram!(
        FLUSH_BYTES,
        Unit::Bytes,
        "Histogram of bytes used in arenas handed to the flush worker"
    );
}
