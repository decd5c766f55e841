// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashSet;

use tokio::sync::broadcast;

use handoff_types::identifiers::NodeId;

/// Change in the failure detector's view of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
    Up(NodeId),
    Down(NodeId),
    /// The node left the cluster for good.
    Removed(NodeId),
}

impl ReachabilityEvent {
    pub fn node(&self) -> NodeId {
        match self {
            ReachabilityEvent::Up(node)
            | ReachabilityEvent::Down(node)
            | ReachabilityEvent::Removed(node) => *node,
        }
    }
}

/// Cluster membership and failure detection, provided by the embedding node.
pub trait ClusterMembership: Send + Sync + 'static {
    fn is_reachable(&self, node: NodeId) -> bool;

    /// All nodes currently part of the cluster, reachable or not.
    fn current_membership(&self) -> HashSet<NodeId>;

    fn subscribe(&self) -> broadcast::Receiver<ReachabilityEvent>;
}
