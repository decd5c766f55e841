// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The hint record and its binary frame.
//!
//! A frame is laid out as follows (all integers big-endian):
//!
//! ```text
//! u32   body length
//! body:
//!   u16   number of targets
//!   [u8; 16] per target
//!   u64   created at (millis since epoch)
//!   u32   ttl in seconds
//!   u32   payload length
//!   ..    payload
//! u64   xxh3 checksum of the body
//! ```
//!
//! Frames are self-delimiting so that a segment body is simply a concatenation of frames.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use xxhash_rust::xxh3::xxh3_64;

use crate::identifiers::NodeId;
use crate::time::MillisSinceEpoch;

pub const FRAME_PREFIX_LEN: usize = size_of::<u32>();
pub const FRAME_TRAILER_LEN: usize = size_of::<u64>();
/// Fixed part of the body, without targets and payload.
const BODY_FIXED_LEN: usize = size_of::<u16>() + size_of::<u64>() + 2 * size_of::<u32>();

pub const MAX_TARGETS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("frame checksum mismatch: expected {expected:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { expected: u64, computed: u64 },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// A mutation buffered on behalf of one or more replicas that were unreachable at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintRecord {
    targets: BTreeSet<NodeId>,
    payload: Bytes,
    created_at: MillisSinceEpoch,
    ttl_seconds: u32,
}

impl HintRecord {
    pub fn new(
        targets: impl IntoIterator<Item = NodeId>,
        payload: impl Into<Bytes>,
        created_at: MillisSinceEpoch,
        ttl_seconds: u32,
    ) -> Self {
        Self {
            targets: targets.into_iter().collect(),
            payload: payload.into(),
            created_at,
            ttl_seconds,
        }
    }

    pub fn targets(&self) -> &BTreeSet<NodeId> {
        &self.targets
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn created_at(&self) -> MillisSinceEpoch {
        self.created_at
    }

    pub fn ttl_seconds(&self) -> u32 {
        self.ttl_seconds
    }

    /// The instant at which this hint stops being deliverable.
    pub fn expires_at(&self) -> MillisSinceEpoch {
        self.created_at
            .saturating_add(Duration::from_secs(u64::from(self.ttl_seconds)))
    }

    pub fn is_expired(&self, now: MillisSinceEpoch) -> bool {
        now >= self.expires_at()
    }

    fn body_len(&self) -> usize {
        BODY_FIXED_LEN + self.targets.len() * NodeId::ENCODED_LEN + self.payload.len()
    }

    /// Exact number of bytes [`encode_into`](Self::encode_into) writes.
    pub fn encoded_len(&self) -> usize {
        FRAME_PREFIX_LEN + self.body_len() + FRAME_TRAILER_LEN
    }

    /// Serializes the frame into `frame`, which must be exactly [`encoded_len`](Self::encoded_len)
    /// bytes long.
    ///
    /// # Panics
    /// If `frame` is not exactly sized or if the record carries more than [`MAX_TARGETS`] targets.
    pub fn encode_into(&self, frame: &mut [u8]) {
        assert_eq!(
            frame.len(),
            self.encoded_len(),
            "frame buffer must be exactly sized"
        );
        assert!(self.targets.len() <= MAX_TARGETS, "too many targets");
        let body_len = self.body_len();

        let (prefix, rest) = frame.split_at_mut(FRAME_PREFIX_LEN);
        let (body, trailer) = rest.split_at_mut(body_len);

        prefix.copy_from_slice(&(body_len as u32).to_be_bytes());
        {
            let mut cursor = &mut body[..];
            self.encode_body(&mut cursor);
            debug_assert!(cursor.is_empty());
        }
        trailer.copy_from_slice(&xxh3_64(body).to_be_bytes());
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        let len = self.encoded_len();
        buf.resize(start + len, 0);
        self.encode_into(&mut buf[start..start + len]);
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.targets.len() as u16);
        for target in &self.targets {
            buf.put_slice(target.as_bytes());
        }
        buf.put_u64(self.created_at.as_u64());
        buf.put_u32(self.ttl_seconds);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Decodes one frame from the front of `buf`, advancing it past the frame.
    ///
    /// On error, `buf` is left at an unspecified position.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        ensure_remaining(buf, FRAME_PREFIX_LEN)?;
        let body_len = buf.get_u32() as usize;
        if body_len < BODY_FIXED_LEN {
            return Err(CodecError::Malformed("body shorter than its fixed fields"));
        }
        ensure_remaining(buf, body_len + FRAME_TRAILER_LEN)?;

        let body = buf.copy_to_bytes(body_len);
        let expected = buf.get_u64();
        let computed = xxh3_64(&body);
        if expected != computed {
            return Err(CodecError::ChecksumMismatch { expected, computed });
        }

        Self::decode_body(body)
    }

    fn decode_body(mut body: Bytes) -> Result<Self, CodecError> {
        let target_count = body.get_u16() as usize;
        let targets_len = target_count * NodeId::ENCODED_LEN;
        if body.remaining() < targets_len + BODY_FIXED_LEN - size_of::<u16>() {
            return Err(CodecError::Malformed("target list overruns the body"));
        }

        let mut targets = BTreeSet::new();
        for _ in 0..target_count {
            let mut raw = [0u8; NodeId::ENCODED_LEN];
            body.copy_to_slice(&mut raw);
            targets.insert(NodeId::from_bytes(raw));
        }

        let created_at = MillisSinceEpoch::new(body.get_u64());
        let ttl_seconds = body.get_u32();
        let payload_len = body.get_u32() as usize;
        if body.remaining() != payload_len {
            return Err(CodecError::Malformed("payload length does not match the body"));
        }

        Ok(Self {
            targets,
            payload: body,
            created_at,
            ttl_seconds,
        })
    }
}

fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> Result<(), CodecError> {
    let available = buf.remaining();
    if available < needed {
        Err(CodecError::Truncated { needed, available })
    } else {
        Ok(())
    }
}
