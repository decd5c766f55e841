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
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use googletest::prelude::*;
use test_log::test;

use handoff_service::test_util::{MockMembership, RecordingDelivery};
use handoff_service::{DeliveryError, DispatcherState, HintsService, RecordHintError};
use handoff_types::config::HintsOptions;
use handoff_types::identifiers::NodeId;
use handoff_types::retries::RetryPolicy;
use handoff_types::time::MillisSinceEpoch;
use handoff_types::{ByteCount, NonZeroByteCount};

const WAIT: Duration = Duration::from_secs(10);
const TTL: u32 = 3600;

fn options(dir: &Path) -> HintsOptions {
    HintsOptions {
        hints_dir: dir.to_path_buf(),
        arena_size: NonZeroByteCount::new(NonZeroUsize::new(64 * 1024).unwrap()),
        // flushes are triggered by the tests
        flush_interval: Duration::from_secs(3600).into(),
        cleanup_interval: Duration::from_secs(3600).into(),
        retry_delay: Duration::from_millis(100).into(),
        delivery_timeout: Duration::from_secs(5).into(),
        dispatch_throttle: ByteCount::ZERO,
        ..HintsOptions::default()
    }
}

struct Harness {
    membership: Arc<MockMembership>,
    delivery: Arc<RecordingDelivery>,
    service: HintsService,
}

impl Harness {
    async fn start(
        options: HintsOptions,
        members: impl IntoIterator<Item = NodeId>,
    ) -> anyhow::Result<Self> {
        let membership = Arc::new(MockMembership::new(members));
        let delivery = Arc::new(RecordingDelivery::default());
        let service = HintsService::start(options, membership.clone(), delivery.clone()).await?;
        Ok(Self {
            membership,
            delivery,
            service,
        })
    }

    async fn record(&self, target: NodeId, payload: impl Into<Bytes>) -> anyhow::Result<()> {
        self.service.record_hint([target], payload, TTL).await?;
        Ok(())
    }

    async fn wait_for_state(
        &self,
        target: NodeId,
        state: DispatcherState,
    ) -> anyhow::Result<DispatcherState> {
        let handle = self
            .service
            .dispatcher(target)
            .ok_or_else(|| anyhow::anyhow!("no dispatcher for {target}"))?;
        Ok(tokio::time::timeout(WAIT, handle.wait_for_state(state)).await?)
    }
}

fn payload(i: usize) -> Bytes {
    Bytes::from(format!("mutation-{i}"))
}

fn target_dir(root: &Path, target: NodeId) -> PathBuf {
    root.join(target.to_string())
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

fn segment_files(root: &Path, target: NodeId) -> anyhow::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(target_dir(root, target))? {
        if entry?.path().extension().is_some_and(|ext| ext == "segment") {
            count += 1;
        }
    }
    Ok(count)
}

#[test(tokio::test)]
async fn delivers_accumulated_hints_in_order_once_reachable() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let harness = Harness::start(options(dir.path()), [target]).await?;

    for i in 0..20 {
        harness.record(target, payload(i)).await?;
    }
    harness.service.flush().await?;
    assert_that!(harness.service.pending_count(target), eq(20));
    assert_that!(harness.service.store_size(target), gt(0));
    assert_that!(
        harness.service.dispatcher_state(target),
        some(eq(DispatcherState::Idle))
    );
    assert_that!(harness.delivery.attempts(), eq(0));

    harness.membership.set_up(target);
    assert!(harness.delivery.wait_for_deliveries(20, WAIT).await);
    assert_that!(
        harness.wait_for_state(target, DispatcherState::Idle).await?,
        eq(DispatcherState::Idle)
    );

    let expected: Vec<_> = (0..20).map(payload).collect();
    assert_eq!(expected, harness.delivery.delivered_to(target));
    assert_that!(harness.service.pending_count(target), eq(0));
    assert_that!(segment_files(dir.path(), target)?, eq(0));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn caught_up_dispatcher_delivers_new_segments() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let harness = Harness::start(options(dir.path()), [target]).await?;
    harness.membership.set_up(target);

    harness.record(target, payload(0)).await?;
    harness.service.flush().await?;
    assert!(harness.delivery.wait_for_deliveries(1, WAIT).await);
    harness.wait_for_state(target, DispatcherState::Idle).await?;

    // no reachability change, the append alone wakes the dispatcher
    harness.record(target, payload(1)).await?;
    harness.service.flush().await?;
    assert!(harness.delivery.wait_for_deliveries(2, WAIT).await);
    assert_eq!(
        vec![payload(0), payload(1)],
        harness.delivery.delivered_to(target)
    );

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn forced_retire_deletes_all_segments() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(7);
    let harness = Harness::start(options(dir.path()), [target]).await?;

    for i in 0..5 {
        harness.record(target, payload(i)).await?;
        harness.service.flush().await?;
    }
    assert_that!(segment_files(dir.path(), target)?, eq(5));

    harness.service.force_retire(target).await?;
    assert_that!(
        harness.service.dispatcher_state(target),
        some(eq(DispatcherState::Retired))
    );
    assert!(!target_dir(dir.path(), target).exists());
    assert_that!(harness.service.store_size(target), eq(0));

    // later hints for the target are dropped
    harness.record(target, payload(5)).await?;
    harness.service.flush().await?;
    assert!(!target_dir(dir.path(), target).exists());
    assert_that!(harness.service.pending_count(target), eq(0));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn expired_hints_are_skipped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let harness = Harness::start(options(dir.path()), [target]).await?;

    harness
        .service
        .record_hint([target], Bytes::from_static(b"stale"), 0)
        .await?;
    harness.record(target, Bytes::from_static(b"fresh")).await?;
    harness.service.flush().await?;

    harness.membership.set_up(target);
    assert!(harness.delivery.wait_for_deliveries(1, WAIT).await);
    harness.wait_for_state(target, DispatcherState::Idle).await?;

    assert_eq!(
        vec![Bytes::from_static(b"fresh")],
        harness.delivery.delivered_to(target)
    );
    assert_that!(harness.delivery.attempts(), eq(1));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn retryable_failure_keeps_the_cursor() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let harness = Harness::start(options(dir.path()), [target]).await?;
    harness
        .delivery
        .fail_next(DeliveryError::retry_later("replica is overloaded"));

    for i in 0..3 {
        harness.record(target, payload(i)).await?;
    }
    harness.service.flush().await?;
    harness.membership.set_up(target);

    assert!(harness.delivery.wait_for_deliveries(3, WAIT).await);
    harness.wait_for_state(target, DispatcherState::Idle).await?;
    assert_eq!(
        vec![payload(0), payload(1), payload(2)],
        harness.delivery.delivered_to(target)
    );
    assert_that!(harness.delivery.attempts(), eq(4));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn fatal_failure_retires_the_target() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let harness = Harness::start(options(dir.path()), [target]).await?;
    harness
        .delivery
        .fail_next(DeliveryError::fatal("replica was decommissioned"));

    harness.record(target, payload(0)).await?;
    harness.record(target, payload(1)).await?;
    harness.service.flush().await?;
    harness.membership.set_up(target);

    assert_that!(
        harness.wait_for_state(target, DispatcherState::Retired).await?,
        eq(DispatcherState::Retired)
    );
    assert!(harness.delivery.delivered().is_empty());
    assert_that!(harness.service.pending_count(target), eq(0));
    assert!(!target_dir(dir.path(), target).exists());

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn drop_mode_rejects_hints_when_buffer_is_full() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let options = HintsOptions {
        arena_size: NonZeroByteCount::new(NonZeroUsize::new(8 * 1024).unwrap()),
        max_buffered_bytes: ByteCount::<true>::new(8 * 1024),
        drop_on_backpressure: true,
        ..options(dir.path())
    };
    let harness = Harness::start(options, [target]).await?;

    // each hint takes 1046 bytes of the 8 KiB budget
    let big = Bytes::from(vec![b'x'; 1000]);
    for _ in 0..7 {
        harness.record(target, big.clone()).await?;
    }
    let err = harness
        .service
        .record_hint([target], big.clone(), TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, RecordHintError::Backpressure), "{err}");

    // flushing hands the budget back
    harness.service.flush().await?;
    harness.record(target, big).await?;
    assert_that!(harness.service.pending_count(target), eq(7));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn shutdown_persists_buffered_hints_for_the_next_start() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(3);

    let first = Harness::start(options(dir.path()), [target]).await?;
    for i in 0..5 {
        first.record(target, payload(i)).await?;
    }
    first.service.shutdown().await;
    let err = first
        .service
        .record_hint([target], payload(5), TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, RecordHintError::Shutdown), "{err}");
    drop(first);

    let second = Harness::start(options(dir.path()), [target]).await?;
    assert_that!(second.service.pending_count(target), eq(5));
    second.membership.set_up(target);
    assert!(second.delivery.wait_for_deliveries(5, WAIT).await);
    second.wait_for_state(target, DispatcherState::Idle).await?;
    let expected: Vec<_> = (0..5).map(payload).collect();
    assert_eq!(expected, second.delivery.delivered_to(target));

    second.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn quota_evicts_the_oldest_segment_first() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let first = NodeId::from_u128(1);
    let second = NodeId::from_u128(2);
    let options = HintsOptions {
        max_disk_bytes: ByteCount::<true>::new(2500),
        ..options(dir.path())
    };
    let harness = Harness::start(options, [first, second]).await?;

    // every segment holds one hint and takes 1094 bytes
    let big = Bytes::from(vec![b'x'; 1000]);
    harness.record(first, big.clone()).await?;
    harness.service.flush().await?;
    harness.record(second, big.clone()).await?;
    harness.service.flush().await?;
    harness.record(first, big).await?;
    harness.service.flush().await?;
    assert_that!(segment_files(dir.path(), first)?, eq(2));

    let report = harness.service.run_cleanup(MillisSinceEpoch::now()).await;
    assert_that!(report.evicted_segments, eq(1));
    assert_that!(report.evicted_records, eq(1));
    assert!(report.retired.is_empty());
    assert_that!(harness.service.pending_count(first), eq(1));
    assert_that!(harness.service.pending_count(second), eq(1));
    assert_that!(
        harness.service.store_size(first) + harness.service.store_size(second),
        le(2500)
    );

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn cleanup_expires_segments_and_retires_departed_targets() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let member = NodeId::from_u128(1);
    let departed = NodeId::from_u128(2);
    let harness = Harness::start(options(dir.path()), [member, departed]).await?;

    harness
        .service
        .record_hint([member, departed], payload(0), 60)
        .await?;
    harness.service.flush().await?;
    harness.membership.forget(departed);

    let later = MillisSinceEpoch::now().saturating_add(Duration::from_secs(120));
    let report = harness.service.run_cleanup(later).await;
    assert_eq!(vec![departed], report.retired);
    assert_that!(report.expired_segments, eq(1));
    assert_that!(report.expired_records, eq(1));
    assert_that!(
        harness.service.dispatcher_state(departed),
        some(eq(DispatcherState::Retired))
    );
    assert_that!(harness.service.pending_count(member), eq(0));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn removed_node_is_retired() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(9);
    let harness = Harness::start(options(dir.path()), [target]).await?;

    harness.record(target, payload(0)).await?;
    harness.service.flush().await?;
    harness.membership.remove(target);

    assert_that!(
        harness.wait_for_state(target, DispatcherState::Retired).await?,
        eq(DispatcherState::Retired)
    );
    assert!(!target_dir(dir.path(), target).exists());

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn paused_dispatch_delivers_after_resume() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let harness = Harness::start(options(dir.path()), [target]).await?;
    harness.service.pause_dispatch();
    harness.membership.set_up(target);

    harness.record(target, payload(0)).await?;
    harness.service.flush().await?;
    harness.wait_for_state(target, DispatcherState::Paused).await?;
    assert!(
        !harness
            .delivery
            .wait_for_attempts(1, Duration::from_millis(200))
            .await
    );

    harness.service.resume_dispatch();
    assert!(harness.delivery.wait_for_deliveries(1, WAIT).await);

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn truncate_removes_hints_of_every_target() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let first = NodeId::from_u128(1);
    let second = NodeId::from_u128(2);
    let harness = Harness::start(options(dir.path()), [first, second]).await?;

    harness
        .service
        .record_hint([first, second], payload(0), TTL)
        .await?;
    harness.service.flush().await?;
    assert_that!(harness.service.pending_count(first), eq(1));

    assert_that!(harness.service.truncate_all_hints().await?, eq(2));
    assert_that!(harness.service.pending_count(first), eq(0));
    assert_that!(harness.service.pending_count(second), eq(0));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn invalid_hints_are_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let options = HintsOptions {
        arena_size: NonZeroByteCount::new(NonZeroUsize::new(1024).unwrap()),
        ..options(dir.path())
    };
    let harness = Harness::start(options, [NodeId::from_u128(1)]).await?;

    let err = harness
        .service
        .record_hint(Vec::<NodeId>::new(), payload(0), TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, RecordHintError::NoTargets), "{err}");

    let err = harness
        .service
        .record_hint([NodeId::from_u128(1)], vec![0u8; 2048], TTL)
        .await
        .unwrap_err();
    assert!(
        matches!(err, RecordHintError::TooLarge { limit: 1024, .. }),
        "{err}"
    );

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn full_arena_becomes_one_segment_per_target() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let options = HintsOptions {
        arena_size: NonZeroByteCount::new(NonZeroUsize::new(250).unwrap()),
        ..options(dir.path())
    };
    let harness = Harness::start(options, [target]).await?;

    // 100 byte frames, the third does not fit and retires the arena
    let payload = Bytes::from(vec![b'p'; 54]);
    for _ in 0..3 {
        harness.record(target, payload.clone()).await?;
    }
    wait_until(|| harness.service.pending_count(target) == 2).await?;
    assert_that!(segment_files(dir.path(), target)?, eq(1));

    harness.service.flush().await?;
    assert_that!(harness.service.pending_count(target), eq(3));
    assert_that!(segment_files(dir.path(), target)?, eq(2));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn failing_segment_writes_drop_the_hints() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let options = HintsOptions {
        flush_retry_policy: RetryPolicy::fixed_delay(Duration::from_millis(10), Some(3)),
        ..options(dir.path())
    };
    let harness = Harness::start(options, [target]).await?;
    // the target directory cannot be created
    std::fs::write(target_dir(dir.path(), target), b"in the way")?;

    for i in 0..3 {
        harness.record(target, payload(i)).await?;
    }
    harness.service.flush().await?;
    assert_that!(harness.service.pending_count(target), eq(0));
    assert_that!(harness.service.store_size(target), eq(0));
    assert!(harness.service.dispatcher(target).is_none());

    // nothing stays stuck once the disk recovers
    std::fs::remove_file(target_dir(dir.path(), target))?;
    harness.record(target, payload(3)).await?;
    harness.service.flush().await?;
    assert_that!(harness.service.pending_count(target), eq(1));

    harness.membership.set_up(target);
    assert!(harness.delivery.wait_for_deliveries(1, WAIT).await);
    assert_eq!(vec![payload(3)], harness.delivery.delivered_to(target));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn target_going_down_stops_draining_at_a_record_boundary() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let harness = Harness::start(options(dir.path()), [target]).await?;
    harness.delivery.set_latency(Duration::from_millis(50));

    for i in 0..10 {
        harness.record(target, payload(i)).await?;
    }
    harness.service.flush().await?;

    harness.membership.set_up(target);
    assert!(harness.delivery.wait_for_deliveries(2, WAIT).await);
    harness.membership.set_down(target);
    harness.wait_for_state(target, DispatcherState::Idle).await?;

    let delivered = harness.delivery.delivered().len();
    assert_that!(delivered, lt(10));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_that!(harness.delivery.delivered().len(), eq(delivered));

    harness.delivery.set_latency(Duration::ZERO);
    harness.membership.set_up(target);
    assert!(harness.delivery.wait_for_deliveries(10, WAIT).await);
    harness.wait_for_state(target, DispatcherState::Idle).await?;

    // resumed where it stopped, nothing delivered twice
    let expected: Vec<_> = (0..10).map(payload).collect();
    assert_eq!(expected, harness.delivery.delivered_to(target));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn timed_out_delivery_is_retried() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let options = HintsOptions {
        delivery_timeout: Duration::from_millis(100).into(),
        ..options(dir.path())
    };
    let harness = Harness::start(options, [target]).await?;
    harness.delivery.set_latency(Duration::from_secs(1));

    for i in 0..2 {
        harness.record(target, payload(i)).await?;
    }
    harness.service.flush().await?;
    harness.membership.set_up(target);

    // the first attempt times out, the dispatcher comes back after the retry delay
    assert!(harness.delivery.wait_for_attempts(2, WAIT).await);
    assert!(harness.delivery.delivered().is_empty());
    assert_that!(
        harness.service.dispatcher_state(target),
        some(not(eq(DispatcherState::Retired)))
    );

    harness.delivery.set_latency(Duration::ZERO);
    assert!(harness.delivery.wait_for_deliveries(2, WAIT).await);
    assert_eq!(
        vec![payload(0), payload(1)],
        harness.delivery.delivered_to(target)
    );

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn blocking_mode_waits_for_buffer_space() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let options = HintsOptions {
        arena_size: NonZeroByteCount::new(NonZeroUsize::new(8 * 1024).unwrap()),
        max_buffered_bytes: ByteCount::<true>::new(8 * 1024),
        drop_on_backpressure: false,
        ..options(dir.path())
    };
    let harness = Harness::start(options, [target]).await?;

    let big = Bytes::from(vec![b'x'; 1000]);
    for _ in 0..7 {
        harness.record(target, big.clone()).await?;
    }
    let blocked =
        tokio::time::timeout(Duration::from_millis(200), harness.record(target, big.clone()))
            .await;
    assert!(blocked.is_err());

    // a flush frees the budget and lets the waiting writer through
    let (recorded, flushed) = tokio::join!(harness.record(target, big.clone()), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.service.flush().await
    });
    recorded?;
    flushed?;
    assert_that!(harness.service.pending_count(target), eq(7));

    harness.service.flush().await?;
    assert_that!(harness.service.pending_count(target), eq(8));

    harness.service.shutdown().await;
    Ok(())
}

#[test(tokio::test)]
async fn dispatch_is_paced_by_the_throttle() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = NodeId::from_u128(1);
    let options = HintsOptions {
        dispatch_throttle: ByteCount::<true>::new(2048),
        ..options(dir.path())
    };
    let harness = Harness::start(options, [target]).await?;

    let big = Bytes::from(vec![b'x'; 1000]);
    for _ in 0..6 {
        harness.record(target, big.clone()).await?;
    }
    harness.service.flush().await?;

    let started = tokio::time::Instant::now();
    harness.membership.set_up(target);
    assert!(harness.delivery.wait_for_deliveries(6, WAIT).await);
    // two payloads fit the initial burst, the other 4000 bytes go at 2048 bytes per second
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
    assert_that!(harness.delivery.delivered_to(target).len(), eq(6));

    harness.service.shutdown().await;
    Ok(())
}
