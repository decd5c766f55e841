// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use super::InvalidConfigurationError;
use crate::retries::RetryPolicy;
use crate::{ByteCount, NonZeroByteCount};

/// # Hinted handoff options
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HintsOptions {
    /// # Hints directory
    ///
    /// Root directory of the hints store. Every target gets its own sub-directory.
    pub hints_dir: PathBuf,

    /// # Arena size
    ///
    /// Size of one in-memory staging arena. A full arena is flushed to disk as one segment
    /// per target, hence this also bounds the size of a segment. A single hint must fit in
    /// one arena.
    pub arena_size: NonZeroByteCount,

    /// # Maximum buffered bytes
    ///
    /// Upper bound of hint bytes accepted but not yet written to disk. Writers wait (or have
    /// their hint dropped, see `drop-on-backpressure`) once this is exhausted. Set to 0 to
    /// disable the limit.
    pub max_buffered_bytes: ByteCount,

    /// # Drop on backpressure
    ///
    /// If true, hints that would exceed `max-buffered-bytes` are dropped and counted instead
    /// of blocking the writer.
    pub drop_on_backpressure: bool,

    /// # Maximum disk bytes
    ///
    /// Upper bound of the total size of all target stores. The oldest segments are evicted
    /// first when exceeded. Set to 0 to disable the limit.
    pub max_disk_bytes: ByteCount,

    /// # Flush interval
    ///
    /// Interval at which a partially filled arena is flushed to disk.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub flush_interval: humantime::Duration,

    /// # Flush retry policy
    ///
    /// Retries of a failing segment write. Once exhausted the affected hints are dropped.
    pub flush_retry_policy: RetryPolicy,

    /// # Dispatch throttle
    ///
    /// Maximum bytes per second replayed to a single target. Set to 0 to disable throttling.
    pub dispatch_throttle: ByteCount,

    /// # Delivery timeout
    ///
    /// A delivery not acknowledged within this time is treated as a retryable failure.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub delivery_timeout: humantime::Duration,

    /// # Retry delay
    ///
    /// Delay before a dispatcher re-checks a reachable target after a retryable failure.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub retry_delay: humantime::Duration,

    /// # Cleanup interval
    ///
    /// Interval of the expiry, disk quota and membership cleanup.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    pub cleanup_interval: humantime::Duration,
}

impl HintsOptions {
    pub fn arena_size(&self) -> NonZeroUsize {
        self.arena_size.as_non_zero_usize()
    }

    /// `None` if unlimited
    pub fn max_disk_bytes(&self) -> Option<u64> {
        (!self.max_disk_bytes.is_zero()).then(|| self.max_disk_bytes.as_u64())
    }

    /// `None` if unlimited
    pub fn dispatch_throttle(&self) -> Option<NonZeroU32> {
        u32::try_from(self.dispatch_throttle.as_u64())
            .ok()
            .and_then(NonZeroU32::new)
    }

    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        if self.hints_dir.as_os_str().is_empty() {
            return Err(InvalidConfigurationError::new(
                "hints-dir",
                "must not be empty",
            ));
        }
        // frame and segment lengths are u32
        if self.arena_size.as_u64() > u64::from(u32::MAX) {
            return Err(InvalidConfigurationError::new(
                "arena-size",
                "must not exceed 4 GiB",
            ));
        }
        if self.dispatch_throttle.as_u64() > u64::from(u32::MAX) {
            return Err(InvalidConfigurationError::new(
                "dispatch-throttle",
                "must not exceed 4 GiB per second",
            ));
        }
        if !self.max_buffered_bytes.is_zero()
            && self.max_buffered_bytes.as_u64() < self.arena_size.as_u64()
        {
            return Err(InvalidConfigurationError::new(
                "max-buffered-bytes",
                format!(
                    "must be 0 or at least the arena size ({})",
                    self.arena_size
                ),
            ));
        }
        for (option, value) in [
            ("flush-interval", self.flush_interval),
            ("delivery-timeout", self.delivery_timeout),
            ("retry-delay", self.retry_delay),
            ("cleanup-interval", self.cleanup_interval),
        ] {
            if Duration::from(value).is_zero() {
                return Err(InvalidConfigurationError::new(option, "must be non-zero"));
            }
        }
        Ok(())
    }
}

impl Default for HintsOptions {
    fn default() -> Self {
        Self {
            hints_dir: PathBuf::from("hints"),
            arena_size: NonZeroByteCount::new(
                NonZeroUsize::new(32 * 1024 * 1024).expect("non-zero"),
            ),
            max_buffered_bytes: ByteCount::<true>::new(128 * 1024 * 1024),
            drop_on_backpressure: false,
            max_disk_bytes: ByteCount::ZERO,
            flush_interval: Duration::from_secs(10).into(),
            flush_retry_policy: RetryPolicy::exponential(
                Duration::from_millis(50),
                2.0,
                Some(5),
                Some(Duration::from_secs(2)),
            ),
            dispatch_throttle: ByteCount::<true>::new(1024 * 1024),
            delivery_timeout: Duration::from_secs(10).into(),
            retry_delay: Duration::from_secs(10).into(),
            cleanup_interval: Duration::from_secs(60).into(),
        }
    }
}
