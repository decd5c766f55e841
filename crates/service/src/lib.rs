// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Hinted handoff: writes meant for unreachable replicas are buffered, persisted per target
//! and replayed once the target is reachable again.

mod delivery;
mod dispatcher;
mod error;
mod flusher;
mod lifecycle;
mod membership;
mod metric_definitions;
mod service;
mod throttle;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use delivery::{DeliveryError, HintDelivery};
pub use dispatcher::{DispatcherHandle, DispatcherState};
pub use error::{RecordHintError, ShutdownError, StartError};
pub use lifecycle::CleanupReport;
pub use membership::{ClusterMembership, ReachabilityEvent};
pub use service::HintsService;
