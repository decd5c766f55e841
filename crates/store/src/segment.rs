// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Segment files.
//!
//! ```text
//! header (40 bytes, big-endian):
//!   [u8; 4] magic "HNTS"
//!   u16     format version
//!   u16     reserved
//!   u64     sequence number
//!   u32     record count
//!   u32     reserved
//!   u64     body length
//!   u64     max expiry of all records (millis since epoch)
//! body:     concatenated hint frames
//! trailer:  u64 xxh3 of header and body
//! ```
//!
//! A segment is first written to `<name>.tmp`, synced and then renamed into place, so a
//! segment file with a valid length and checksum is always complete.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::trace;
use xxhash_rust::xxh3::{Xxh3, xxh3_64};

use handoff_types::time::MillisSinceEpoch;

use crate::StoreError;

pub const SEGMENT_MAGIC: [u8; 4] = *b"HNTS";
pub const SEGMENT_FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 40;
pub const TRAILER_LEN: usize = size_of::<u64>();

const SEGMENT_EXTENSION: &str = ".segment";
pub(crate) const TMP_EXTENSION: &str = ".tmp";

/// Position of a segment in its target's log. Strictly increasing per target.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
pub struct SegmentId(u64);

impl SegmentId {
    pub const INVALID: SegmentId = SegmentId(0);
    pub const OLDEST: SegmentId = SegmentId(1);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn file_name(self) -> String {
        format!("{:020}{SEGMENT_EXTENSION}", self.0)
    }

    pub(crate) fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(SEGMENT_EXTENSION)?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok().map(SegmentId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub id: SegmentId,
    pub record_count: u32,
    pub body_len: u64,
    pub max_expires_at: MillisSinceEpoch,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        let mut buf = &mut header[..];
        buf.put_slice(&SEGMENT_MAGIC);
        buf.put_u16(SEGMENT_FORMAT_VERSION);
        buf.put_u16(0);
        buf.put_u64(self.id.as_u64());
        buf.put_u32(self.record_count);
        buf.put_u32(0);
        buf.put_u64(self.body_len);
        buf.put_u64(self.max_expires_at.as_u64());
        debug_assert!(buf.is_empty());
        header
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, &'static str> {
        if buf.len() < HEADER_LEN {
            return Err("shorter than a segment header");
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SEGMENT_MAGIC {
            return Err("bad magic");
        }
        if buf.get_u16() != SEGMENT_FORMAT_VERSION {
            return Err("unsupported format version");
        }
        let _reserved = buf.get_u16();
        let id = SegmentId(buf.get_u64());
        let record_count = buf.get_u32();
        let _reserved = buf.get_u32();
        let body_len = buf.get_u64();
        let max_expires_at = MillisSinceEpoch::new(buf.get_u64());
        Ok(Self {
            id,
            record_count,
            body_len,
            max_expires_at,
        })
    }

    pub fn file_len(&self) -> u64 {
        (HEADER_LEN + TRAILER_LEN) as u64 + self.body_len
    }
}

/// What the store keeps in memory about a segment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    pub id: SegmentId,
    pub record_count: u32,
    pub size_bytes: u64,
    pub max_expires_at: MillisSinceEpoch,
    /// When the segment reached disk, orders segments across targets for quota eviction.
    pub flushed_at: MillisSinceEpoch,
}

impl SegmentMeta {
    fn new(header: &SegmentHeader, flushed_at: MillisSinceEpoch) -> Self {
        Self {
            id: header.id,
            record_count: header.record_count,
            size_bytes: header.file_len(),
            max_expires_at: header.max_expires_at,
            flushed_at,
        }
    }
}

pub(crate) fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(id.file_name())
}

/// Writes `frames` as segment `id` in `dir`. The segment is durable once this returns.
pub(crate) async fn write_segment(
    dir: &Path,
    id: SegmentId,
    frames: &[&[u8]],
    record_count: u32,
    max_expires_at: MillisSinceEpoch,
) -> Result<SegmentMeta, StoreError> {
    let header = SegmentHeader {
        id,
        record_count,
        body_len: frames.iter().map(|f| f.len() as u64).sum(),
        max_expires_at,
    };
    let encoded_header = header.encode();
    let mut hasher = Xxh3::new();
    hasher.update(&encoded_header);
    for frame in frames {
        hasher.update(frame);
    }
    let checksum = hasher.digest();

    let path = segment_path(dir, id);
    let tmp_path = dir.join(format!("{}{TMP_EXTENSION}", id.file_name()));
    let file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(StoreError::io(&tmp_path))?;
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);
    writer
        .write_all(&encoded_header)
        .await
        .map_err(StoreError::io(&tmp_path))?;
    for frame in frames {
        writer
            .write_all(frame)
            .await
            .map_err(StoreError::io(&tmp_path))?;
    }
    writer
        .write_u64(checksum)
        .await
        .map_err(StoreError::io(&tmp_path))?;
    writer.flush().await.map_err(StoreError::io(&tmp_path))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(StoreError::io(&tmp_path))?;

    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(StoreError::io(&path))?;
    sync_dir(dir).await?;

    trace!(
        segment = %id,
        records = record_count,
        bytes = header.file_len(),
        "Wrote segment {}",
        path.display()
    );
    Ok(SegmentMeta::new(&header, MillisSinceEpoch::now()))
}

/// Reads and validates a whole segment, returning its header and body.
pub(crate) async fn read_segment(path: &Path) -> Result<(SegmentHeader, Bytes), StoreError> {
    let content = Bytes::from(
        tokio::fs::read(path)
            .await
            .map_err(StoreError::io(path))?,
    );
    let header = validate(&content).map_err(|reason| StoreError::corrupted(path, reason))?;
    let body = content.slice(HEADER_LEN..HEADER_LEN + header.body_len as usize);
    Ok((header, body))
}

/// Validates a segment file and returns its metadata without keeping the body around.
pub(crate) async fn inspect_segment(path: &Path) -> Result<SegmentMeta, StoreError> {
    let (header, _) = read_segment(path).await?;
    let flushed_at = tokio::fs::metadata(path)
        .await
        .and_then(|metadata| metadata.modified())
        .map(MillisSinceEpoch::from)
        .map_err(StoreError::io(path))?;
    Ok(SegmentMeta::new(&header, flushed_at))
}

fn validate(content: &[u8]) -> Result<SegmentHeader, String> {
    let header = SegmentHeader::decode(content)?;
    if content.len() as u64 != header.file_len() {
        return Err(format!(
            "file is {} bytes, header announces {}",
            content.len(),
            header.file_len()
        ));
    }
    let (covered, mut trailer) = content.split_at(content.len() - TRAILER_LEN);
    let expected = trailer.get_u64();
    let computed = xxh3_64(covered);
    if expected != computed {
        return Err(format!(
            "checksum mismatch: expected {expected:#018x}, computed {computed:#018x}"
        ));
    }
    Ok(header)
}

pub(crate) async fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(StoreError::io(dir))?;
    handle.sync_all().await.map_err(StoreError::io(dir))
}
