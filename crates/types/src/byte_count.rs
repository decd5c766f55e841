// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use bytesize::ByteSize;
use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A number of bytes, written in configuration either as `"32 MiB"` or as a plain integer.
///
/// `ByteCount<false>` rejects zero when deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteCount<const CAN_BE_ZERO: bool = true>(u64);

pub type NonZeroByteCount = ByteCount<false>;

impl ByteCount<true> {
    pub const ZERO: Self = Self(0);

    pub const fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl ByteCount<false> {
    pub const fn new(bytes: NonZeroUsize) -> Self {
        Self(bytes.get() as u64)
    }

    pub const fn as_non_zero_usize(&self) -> NonZeroUsize {
        match NonZeroUsize::new(self.0 as usize) {
            Some(bytes) => bytes,
            None => panic!("non-zero byte count holds zero"),
        }
    }
}

impl<const CAN_BE_ZERO: bool> ByteCount<CAN_BE_ZERO> {
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Exact: the largest binary unit that divides the value, e.g. `32 MiB` or `1000 B`.
impl<const CAN_BE_ZERO: bool> fmt::Display for ByteCount<CAN_BE_ZERO> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [
            (1 << 40, "TiB"),
            (1 << 30, "GiB"),
            (1 << 20, "MiB"),
            (1 << 10, "KiB"),
        ];
        let bytes = self.0;
        match UNITS
            .iter()
            .find(|(unit, _)| bytes != 0 && bytes % unit == 0)
        {
            Some((unit, name)) => write!(f, "{} {name}", bytes / unit),
            None => write!(f, "{bytes} B"),
        }
    }
}

impl FromStr for ByteCount<true> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<ByteSize>().map(|size| Self(size.as_u64()))
    }
}

impl<const CAN_BE_ZERO: bool> Serialize for ByteCount<CAN_BE_ZERO> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Written<'a> {
    Bytes(u64),
    #[serde(borrow)]
    Text(Cow<'a, str>),
}

impl<'de, const CAN_BE_ZERO: bool> Deserialize<'de> for ByteCount<CAN_BE_ZERO> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = if deserializer.is_human_readable() {
            match Written::deserialize(deserializer)? {
                Written::Bytes(bytes) => bytes,
                Written::Text(text) => text
                    .parse::<ByteSize>()
                    .map_err(|_| {
                        de::Error::invalid_value(Unexpected::Str(&text), &"a size like \"4 MiB\"")
                    })?
                    .as_u64(),
            }
        } else {
            u64::deserialize(deserializer)?
        };

        if bytes == 0 && !CAN_BE_ZERO {
            return Err(de::Error::invalid_value(
                Unexpected::Unsigned(0),
                &"a non-zero size",
            ));
        }
        Ok(Self(bytes))
    }
}
