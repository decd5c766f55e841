// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io;
use std::path::Path;

use bytes::{Buf, BufMut};
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::StoreError;
use crate::segment::{SegmentId, TMP_EXTENSION};

pub(crate) const CURSOR_FILE_NAME: &str = "dispatch.cursor";
const CURSOR_MAGIC: [u8; 4] = *b"HNTC";
const CURSOR_LEN: usize = 4 + 3 * size_of::<u64>();
const CURSOR_FILE_LEN: usize = CURSOR_LEN + size_of::<u64>();

/// Where the dispatcher of a target resumes: the next record to deliver is found at
/// `offset` bytes into the body of `segment`, after `records` records of that segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DispatchCursor {
    pub segment: SegmentId,
    pub offset: u64,
    pub records: u64,
}

impl DispatchCursor {
    pub const fn start_of(segment: SegmentId) -> Self {
        Self {
            segment,
            offset: 0,
            records: 0,
        }
    }

    fn encode(&self) -> [u8; CURSOR_FILE_LEN] {
        let mut out = [0u8; CURSOR_FILE_LEN];
        let (content, trailer) = out.split_at_mut(CURSOR_LEN);
        {
            let mut buf = &mut content[..];
            buf.put_slice(&CURSOR_MAGIC);
            buf.put_u64(self.segment.as_u64());
            buf.put_u64(self.offset);
            buf.put_u64(self.records);
        }
        trailer.copy_from_slice(&xxh3_64(content).to_be_bytes());
        out
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != CURSOR_FILE_LEN {
            return None;
        }
        let (content, mut trailer) = raw.split_at(CURSOR_LEN);
        if trailer.get_u64() != xxh3_64(content) || content[..4] != CURSOR_MAGIC {
            return None;
        }
        let mut buf = &content[4..];
        Some(Self {
            segment: SegmentId::new(buf.get_u64()),
            offset: buf.get_u64(),
            records: buf.get_u64(),
        })
    }

    /// Loads the cursor persisted in `dir`. A missing or unreadable cursor yields `None`,
    /// dispatch then restarts from the oldest segment.
    pub(crate) async fn load(dir: &Path) -> Result<Option<Self>, StoreError> {
        let path = dir.join(CURSOR_FILE_NAME);
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let cursor = Self::decode(&raw);
                if cursor.is_none() {
                    warn!(
                        "Ignoring invalid dispatch cursor '{}', replaying from the oldest segment",
                        path.display()
                    );
                }
                Ok(cursor)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(&path)(err)),
        }
    }

    pub(crate) async fn persist(&self, dir: &Path) -> Result<(), StoreError> {
        let path = dir.join(CURSOR_FILE_NAME);
        let tmp_path = dir.join(format!("{CURSOR_FILE_NAME}{TMP_EXTENSION}"));
        tokio::fs::write(&tmp_path, self.encode())
            .await
            .map_err(StoreError::io(&tmp_path))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(StoreError::io(&path))
    }
}
