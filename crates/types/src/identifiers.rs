// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Opaque identifier of a replica that hints are queued for.
///
/// The hyphenated form is used as the name of the target's directory in the hints store,
/// therefore [`Display`](fmt::Display) and [`FromStr`] must stay inverse of each other.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    derive_more::From,
    derive_more::Into,
)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub const ENCODED_LEN: usize = 16;

    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> Self {
        NodeId(Uuid::from_u128(value))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid node id: {0}")]
pub struct NodeIdParseError(#[from] uuid::Error);

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NodeId(Uuid::try_parse(s)?))
    }
}
