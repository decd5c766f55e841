// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory cluster membership and delivery for tests.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use handoff_types::identifiers::NodeId;

use crate::delivery::{DeliveryError, HintDelivery};
use crate::membership::{ClusterMembership, ReachabilityEvent};

/// Membership whose reachability is flipped by the test.
pub struct MockMembership {
    state: Mutex<MembershipState>,
    events: broadcast::Sender<ReachabilityEvent>,
}

#[derive(Default)]
struct MembershipState {
    members: HashSet<NodeId>,
    reachable: HashSet<NodeId>,
}

impl MockMembership {
    /// All `members` start out unreachable.
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(MembershipState {
                members: members.into_iter().collect(),
                reachable: HashSet::new(),
            }),
            events,
        }
    }

    pub fn set_up(&self, node: NodeId) {
        {
            let mut state = self.state.lock();
            state.members.insert(node);
            state.reachable.insert(node);
        }
        let _ = self.events.send(ReachabilityEvent::Up(node));
    }

    pub fn set_down(&self, node: NodeId) {
        self.state.lock().reachable.remove(&node);
        let _ = self.events.send(ReachabilityEvent::Down(node));
    }

    pub fn remove(&self, node: NodeId) {
        {
            let mut state = self.state.lock();
            state.members.remove(&node);
            state.reachable.remove(&node);
        }
        let _ = self.events.send(ReachabilityEvent::Removed(node));
    }

    /// Drops `node` from the membership without announcing it.
    pub fn forget(&self, node: NodeId) {
        let mut state = self.state.lock();
        state.members.remove(&node);
        state.reachable.remove(&node);
    }
}

impl ClusterMembership for MockMembership {
    fn is_reachable(&self, node: NodeId) -> bool {
        self.state.lock().reachable.contains(&node)
    }

    fn current_membership(&self) -> HashSet<NodeId> {
        self.state.lock().members.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ReachabilityEvent> {
        self.events.subscribe()
    }
}

/// Accepts every payload and remembers it, unless a failure was scripted.
pub struct RecordingDelivery {
    delivered: Mutex<Vec<(NodeId, Bytes)>>,
    failures: Mutex<VecDeque<DeliveryError>>,
    latency: Mutex<Duration>,
    attempts: watch::Sender<usize>,
    count: watch::Sender<usize>,
}

impl Default for RecordingDelivery {
    fn default() -> Self {
        Self {
            delivered: Mutex::default(),
            failures: Mutex::default(),
            latency: Mutex::new(Duration::ZERO),
            attempts: watch::Sender::new(0),
            count: watch::Sender::new(0),
        }
    }
}

impl RecordingDelivery {
    /// The next delivery attempt fails with `err`. Failures queue up in order.
    pub fn fail_next(&self, err: DeliveryError) {
        self.failures.lock().push_back(err);
    }

    /// Every following delivery takes `latency` before it is acknowledged.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn delivered(&self) -> Vec<(NodeId, Bytes)> {
        self.delivered.lock().clone()
    }

    pub fn delivered_to(&self, target: NodeId) -> Vec<Bytes> {
        self.delivered
            .lock()
            .iter()
            .filter(|(node, _)| *node == target)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.borrow()
    }

    /// Waits until at least `count` payloads were accepted. Returns `false` on timeout.
    pub async fn wait_for_deliveries(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|delivered| *delivered >= count))
            .await
            .is_ok_and(|res| res.is_ok())
    }

    /// Waits until at least `count` delivery attempts were made. Returns `false` on timeout.
    pub async fn wait_for_attempts(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.attempts.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|attempts| *attempts >= count))
            .await
            .is_ok_and(|res| res.is_ok())
    }
}

#[async_trait::async_trait]
impl HintDelivery for RecordingDelivery {
    async fn deliver(&self, target: NodeId, payload: Bytes) -> Result<(), DeliveryError> {
        self.attempts.send_modify(|attempts| *attempts += 1);
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let delivered = {
            let mut delivered = self.delivered.lock();
            delivered.push((target, payload));
            delivered.len()
        };
        self.count.send_replace(delivered);
        Ok(())
    }
}
