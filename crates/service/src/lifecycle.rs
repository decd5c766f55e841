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
use std::time::Duration;

use metrics::counter;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use handoff_store::HintsCatalog;
use handoff_types::identifiers::NodeId;
use handoff_types::time::MillisSinceEpoch;

use crate::dispatcher::Dispatchers;
use crate::membership::ClusterMembership;
use crate::metric_definitions::{DROP_REASON, DROP_REASON_DISK_QUOTA, HINTS_DROPPED, HINTS_EXPIRED};

/// What a cleanup run removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Targets that left the cluster and were retired.
    pub retired: Vec<NodeId>,
    pub expired_segments: usize,
    pub expired_records: u64,
    /// Segments deleted to get back under the disk quota.
    pub evicted_segments: usize,
    pub evicted_records: u64,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.retired.is_empty() && self.expired_segments == 0 && self.evicted_segments == 0
    }
}

pub(crate) struct LifecycleManager {
    catalog: Arc<HintsCatalog>,
    dispatchers: Arc<Dispatchers>,
    membership: Arc<dyn ClusterMembership>,
    max_disk_bytes: Option<u64>,
}

impl LifecycleManager {
    pub fn new(
        catalog: Arc<HintsCatalog>,
        dispatchers: Arc<Dispatchers>,
        membership: Arc<dyn ClusterMembership>,
        max_disk_bytes: Option<u64>,
    ) -> Self {
        Self {
            catalog,
            dispatchers,
            membership,
            max_disk_bytes,
        }
    }

    pub async fn run(self: Arc<Self>, cleanup_interval: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(cleanup_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.reset();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.run_once(MillisSinceEpoch::now()).await;
                }
            }
        }
        debug!("Hints lifecycle manager stopped");
    }

    pub async fn run_once(&self, now: MillisSinceEpoch) -> CleanupReport {
        let mut report = CleanupReport::default();
        self.retire_departed(&mut report).await;
        self.expire(now, &mut report).await;
        self.enforce_quota(&mut report).await;

        if report.is_empty() {
            debug!("Hints cleanup found nothing to remove");
        } else {
            info!(
                retired = report.retired.len(),
                expired_segments = report.expired_segments,
                expired_records = report.expired_records,
                evicted_segments = report.evicted_segments,
                evicted_records = report.evicted_records,
                "Hints cleanup finished"
            );
        }
        report
    }

    async fn retire_departed(&self, report: &mut CleanupReport) {
        let members = self.membership.current_membership();
        let known: BTreeSet<_> = self
            .catalog
            .targets()
            .into_iter()
            .chain(self.dispatchers.targets())
            .filter(|target| !self.catalog.is_retired(*target))
            .collect();

        for target in known {
            if members.contains(&target) {
                continue;
            }
            match self.dispatchers.retire(target).await {
                Ok(()) => {
                    info!(target = %target, "Retired hints of a node that left the cluster");
                    report.retired.push(target);
                }
                Err(err) => warn!(target = %target, %err, "Cannot retire hints of a departed node"),
            }
        }
    }

    async fn expire(&self, now: MillisSinceEpoch, report: &mut CleanupReport) {
        for store in self.catalog.stores() {
            match store.discard_expired(now).await {
                Ok(expired) if !expired.is_empty() => {
                    let records: u64 = expired.iter().map(|meta| u64::from(meta.record_count)).sum();
                    debug!(
                        target = %store.target(),
                        segments = expired.len(),
                        records,
                        "Deleted expired hints segments"
                    );
                    counter!(HINTS_EXPIRED).increment(records);
                    report.expired_segments += expired.len();
                    report.expired_records += records;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target = %store.target(), %err, "Cannot delete expired hints segments")
                }
            }
        }
    }

    async fn enforce_quota(&self, report: &mut CleanupReport) {
        let Some(quota) = self.max_disk_bytes else {
            return;
        };

        loop {
            let total = self.catalog.total_size_bytes();
            if total <= quota {
                return;
            }

            let oldest = self
                .catalog
                .stores()
                .into_iter()
                .filter_map(|store| store.oldest_segment().map(|meta| (meta, store)))
                .min_by_key(|(meta, _)| (meta.flushed_at, meta.id));
            let Some((meta, store)) = oldest else {
                return;
            };

            match store.discard(meta.id).await {
                Ok(Some(evicted)) => {
                    warn!(
                        target = %store.target(),
                        segment = %evicted.id,
                        records = evicted.record_count,
                        total_bytes = total,
                        quota_bytes = quota,
                        "Hints store exceeds its disk quota, deleted undelivered hints"
                    );
                    counter!(HINTS_DROPPED, DROP_REASON => DROP_REASON_DISK_QUOTA)
                        .increment(u64::from(evicted.record_count));
                    report.evicted_segments += 1;
                    report.evicted_records += u64::from(evicted.record_count);
                }
                // delivered or expired concurrently
                Ok(None) => {}
                Err(err) => {
                    warn!(target = %store.target(), segment = %meta.id, %err, "Cannot evict hints segment");
                    return;
                }
            }
        }
    }
}
