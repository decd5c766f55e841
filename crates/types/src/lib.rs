// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This crate contains the core types shared by the hinted handoff components.

mod byte_count;

pub mod config;
pub mod config_loader;
pub mod errors;
pub mod hint;
pub mod identifiers;
pub mod retries;
pub mod time;

pub use byte_count::{ByteCount, NonZeroByteCount};
