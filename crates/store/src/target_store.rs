// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use handoff_types::identifiers::NodeId;
use handoff_types::time::MillisSinceEpoch;

use crate::cursor::DispatchCursor;
use crate::reader::HintReader;
use crate::segment::{
    SegmentId, SegmentMeta, TMP_EXTENSION, inspect_segment, segment_path, write_segment,
};
use crate::{Result, StoreError};

/// The durable, append-only log of hints for one target.
///
/// Segments are appended by the flush worker, replayed and discarded by the target's
/// dispatcher, and pruned by the lifecycle manager. All of them may run concurrently;
/// the in-memory segment index is the source of truth for which segments exist.
#[derive(Debug)]
pub struct TargetStore {
    target: NodeId,
    dir: PathBuf,
    state: Mutex<StoreState>,
    appends: watch::Sender<SegmentId>,
    corrupted_on_open: usize,
}

#[derive(Debug)]
struct StoreState {
    segments: BTreeMap<SegmentId, SegmentMeta>,
    next_id: SegmentId,
    cursor: DispatchCursor,
    persisted_cursor: Option<DispatchCursor>,
    destroyed: bool,
}

impl TargetStore {
    /// Opens (or creates) the store of `target` in `dir`, recovering the valid segments.
    ///
    /// Segments failing validation and leftover temporary files are deleted.
    pub async fn open(dir: impl Into<PathBuf>, target: NodeId) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(StoreError::io(&dir))?;

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(StoreError::io(&dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::io(&dir))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TMP_EXTENSION) {
                debug!(target = %target, "Removing leftover temporary file {name}");
                remove_file_if_exists(&entry.path()).await?;
            } else if let Some(id) = SegmentId::parse_file_name(name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut segments = BTreeMap::new();
        let mut corrupted_on_open = 0;
        for id in ids {
            let path = segment_path(&dir, id);
            let result = inspect_segment(&path).await.and_then(|meta| {
                if meta.id == id {
                    Ok(meta)
                } else {
                    Err(StoreError::corrupted(
                        &path,
                        format!("header announces segment {}", meta.id),
                    ))
                }
            });
            match result {
                Ok(meta) => {
                    segments.insert(id, meta);
                }
                Err(err @ StoreError::Corrupted { .. }) => {
                    warn!(target = %target, segment = %id, %err, "Deleting invalid segment");
                    remove_file_if_exists(&path).await?;
                    corrupted_on_open += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let persisted_cursor = DispatchCursor::load(&dir).await?;
        let last = segments.keys().next_back().copied().unwrap_or_default();
        let stored_cursor = persisted_cursor.unwrap_or_default();
        let next_id = last.max(stored_cursor.segment).next();
        let cursor = if segments.contains_key(&stored_cursor.segment) {
            stored_cursor
        } else {
            // the cursor's segment is gone, resume at the next one that still exists
            let resume_at = segments
                .range(stored_cursor.segment..)
                .next()
                .map(|(id, _)| *id)
                .unwrap_or(next_id);
            DispatchCursor::start_of(resume_at)
        };

        if !segments.is_empty() {
            info!(
                target = %target,
                segments = segments.len(),
                records = segments.values().map(|s| u64::from(s.record_count)).sum::<u64>(),
                "Recovered hints store"
            );
        }

        let (appends, _) = watch::channel(last);
        Ok(Self {
            target,
            dir,
            state: Mutex::new(StoreState {
                segments,
                next_id,
                cursor,
                persisted_cursor,
                destroyed: false,
            }),
            appends,
            corrupted_on_open,
        })
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of invalid segments that were deleted while opening.
    pub fn corrupted_on_open(&self) -> usize {
        self.corrupted_on_open
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Durably writes `frames` as the next segment.
    pub async fn append(
        &self,
        frames: &[&[u8]],
        record_count: u32,
        max_expires_at: MillisSinceEpoch,
    ) -> Result<SegmentId> {
        let id = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(StoreError::Retired(self.target));
            }
            let id = state.next_id;
            state.next_id = id.next();
            id
        };

        let meta = write_segment(&self.dir, id, frames, record_count, max_expires_at).await?;
        let size_bytes = meta.size_bytes;
        let destroyed = {
            let mut state = self.state.lock();
            if !state.destroyed {
                state.segments.insert(id, meta);
            }
            state.destroyed
        };
        if destroyed {
            remove_file_if_exists(&segment_path(&self.dir, id)).await?;
            return Err(StoreError::Retired(self.target));
        }
        self.appends.send_replace(id);

        debug!(
            target = %self.target,
            segment = %id,
            records = record_count,
            bytes = size_bytes,
            "Appended hints segment"
        );
        Ok(id)
    }

    /// Replays the store starting at `cursor`.
    pub fn read_from(self: &Arc<Self>, cursor: DispatchCursor) -> HintReader {
        HintReader::new(Arc::clone(self), cursor)
    }

    /// The oldest segment with an id of at least `from`.
    pub(crate) fn next_segment(&self, from: SegmentId) -> Option<SegmentMeta> {
        self.state
            .lock()
            .segments
            .range(from..)
            .next()
            .map(|(_, meta)| meta.clone())
    }

    pub(crate) fn segment_file(&self, id: SegmentId) -> PathBuf {
        segment_path(&self.dir, id)
    }

    /// Deletes every segment up to and including `id`. Segments appended concurrently are
    /// newer and therefore untouched.
    pub async fn discard_up_to(&self, id: SegmentId) -> Result<Vec<SegmentMeta>> {
        let discarded: Vec<SegmentMeta> = {
            let mut state = self.state.lock();
            let keep = state.segments.split_off(&id.next());
            std::mem::replace(&mut state.segments, keep)
                .into_values()
                .collect()
        };
        for meta in &discarded {
            remove_file_if_exists(&self.segment_file(meta.id)).await?;
        }
        if !discarded.is_empty() {
            trace!(
                target = %self.target,
                up_to = %id,
                segments = discarded.len(),
                "Discarded segments"
            );
        }
        Ok(discarded)
    }

    /// Deletes exactly one segment, if it still exists.
    pub async fn discard(&self, id: SegmentId) -> Result<Option<SegmentMeta>> {
        let discarded = self.state.lock().segments.remove(&id);
        if discarded.is_some() {
            remove_file_if_exists(&self.segment_file(id)).await?;
        }
        Ok(discarded)
    }

    /// Deletes the oldest run of segments whose records have all expired at `now`.
    ///
    /// Stops at the first segment still holding a live record, even if newer segments are
    /// fully expired, so segments are always retired in sequence order.
    pub async fn discard_expired(&self, now: MillisSinceEpoch) -> Result<Vec<SegmentMeta>> {
        let last_expired = self
            .state
            .lock()
            .segments
            .values()
            .take_while(|meta| meta.max_expires_at <= now)
            .last()
            .map(|meta| meta.id);
        match last_expired {
            Some(id) => self.discard_up_to(id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Deletes all segments and moves the cursor past them.
    pub async fn truncate(&self) -> Result<Vec<SegmentMeta>> {
        let (last, next_id) = {
            let state = self.state.lock();
            (state.segments.keys().next_back().copied(), state.next_id)
        };
        let discarded = match last {
            Some(last) => self.discard_up_to(last).await?,
            None => Vec::new(),
        };
        self.set_cursor(DispatchCursor::start_of(next_id));
        self.persist_cursor().await?;
        Ok(discarded)
    }

    /// Deletes the whole store directory. Later appends fail with [`StoreError::Retired`].
    pub async fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.segments.clear();
        }
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::io(&self.dir)(err)),
        }
        info!(target = %self.target, "Deleted hints store {}", self.dir.display());
        Ok(())
    }

    pub fn cursor(&self) -> DispatchCursor {
        self.state.lock().cursor
    }

    pub fn set_cursor(&self, cursor: DispatchCursor) {
        self.state.lock().cursor = cursor;
    }

    /// Writes the cursor to disk unless it did not move since it was last persisted.
    pub async fn persist_cursor(&self) -> Result<()> {
        let cursor = {
            let state = self.state.lock();
            if state.destroyed || state.persisted_cursor == Some(state.cursor) {
                return Ok(());
            }
            state.cursor
        };
        cursor.persist(&self.dir).await?;
        self.state.lock().persisted_cursor = Some(cursor);
        Ok(())
    }

    /// Total size of the segment files.
    pub fn size_bytes(&self) -> u64 {
        self.state
            .lock()
            .segments
            .values()
            .map(|meta| meta.size_bytes)
            .sum()
    }

    /// Records not yet delivered, including expired ones not pruned yet.
    pub fn pending_count(&self) -> u64 {
        let state = self.state.lock();
        let cursor = state.cursor;
        let total: u64 = state
            .segments
            .range(cursor.segment..)
            .map(|(_, meta)| u64::from(meta.record_count))
            .sum();
        let consumed = if state.segments.contains_key(&cursor.segment) {
            cursor.records
        } else {
            0
        };
        total.saturating_sub(consumed)
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    pub fn segments(&self) -> Vec<SegmentMeta> {
        self.state.lock().segments.values().cloned().collect()
    }

    pub fn oldest_segment(&self) -> Option<SegmentMeta> {
        self.state
            .lock()
            .segments
            .first_key_value()
            .map(|(_, meta)| meta.clone())
    }

    /// Watches the id of the most recently appended segment.
    pub fn subscribe_appends(&self) -> watch::Receiver<SegmentId> {
        self.appends.subscribe()
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path)(err)),
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use googletest::prelude::*;
    use test_log::test;

    use handoff_types::hint::HintRecord;

    use super::*;

    const TARGET: NodeId = NodeId::from_u128(0xA);

    fn frame(payload: &str, expires_in_secs: u32) -> Bytes {
        let mut buf = BytesMut::new();
        HintRecord::new(
            [TARGET],
            Bytes::copy_from_slice(payload.as_bytes()),
            MillisSinceEpoch::new(1_000_000),
            expires_in_secs,
        )
        .encode(&mut buf);
        buf.freeze()
    }

    async fn append(store: &TargetStore, payloads: &[&str]) -> crate::Result<SegmentId> {
        let frames: Vec<Bytes> = payloads.iter().map(|p| frame(p, 60)).collect();
        let slices: Vec<&[u8]> = frames.iter().map(|f| f.as_ref()).collect();
        store
            .append(
                &slices,
                payloads.len() as u32,
                MillisSinceEpoch::new(1_060_000),
            )
            .await
    }

    #[test(tokio::test)]
    async fn appends_get_increasing_ids() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::open(dir.path().join("t"), TARGET).await?;
        let mut appends = store.subscribe_appends();

        let first = append(&store, &["a", "b"]).await?;
        let second = append(&store, &["c"]).await?;
        assert_that!(first, eq(SegmentId::OLDEST));
        assert_that!(second, eq(SegmentId::new(2)));
        assert_that!(*appends.borrow_and_update(), eq(second));

        assert_that!(store.pending_count(), eq(3));
        assert_that!(store.segment_count(), eq(2));
        assert_that!(
            store.size_bytes(),
            eq(store.segments().iter().map(|s| s.size_bytes).sum::<u64>())
        );
        Ok(())
    }

    #[test(tokio::test)]
    async fn recovery_drops_corrupted_segment_and_keeps_older_ones() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t");
        {
            let store = TargetStore::open(&path, TARGET).await?;
            append(&store, &["a"]).await?;
            append(&store, &["b"]).await?;
            append(&store, &["c"]).await?;
        }
        // damage the newest segment's trailer and leave a stray temporary file around
        let newest = segment_path(&path, SegmentId::new(3));
        let mut raw = std::fs::read(&newest)?;
        let last = raw.len() - 1;
        raw[last] ^= 0x55;
        std::fs::write(&newest, raw)?;
        std::fs::write(path.join("00000000000000000004.segment.tmp"), b"partial")?;

        let store = TargetStore::open(&path, TARGET).await?;
        assert_that!(store.corrupted_on_open(), eq(1));
        let ids: Vec<_> = store.segments().iter().map(|s| s.id).collect();
        assert_eq!(vec![SegmentId::new(1), SegmentId::new(2)], ids);
        assert!(!newest.exists());
        assert!(!path.join("00000000000000000004.segment.tmp").exists());

        assert_that!(append(&store, &["d"]).await?, eq(SegmentId::new(3)));
        Ok(())
    }

    #[test(tokio::test)]
    async fn discard_up_to_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::open(dir.path().join("t"), TARGET).await?;
        for p in ["a", "b", "c"] {
            append(&store, &[p]).await?;
        }

        assert_that!(store.discard_up_to(SegmentId::new(2)).await?.len(), eq(2));
        assert_that!(store.discard_up_to(SegmentId::new(2)).await?.len(), eq(0));
        assert_that!(
            store.oldest_segment().map(|s| s.id),
            some(eq(SegmentId::new(3)))
        );
        assert!(!store.segment_file(SegmentId::new(1)).exists());
        assert!(store.segment_file(SegmentId::new(3)).exists());

        assert!(store.discard(SegmentId::new(3)).await?.is_some());
        assert!(store.discard(SegmentId::new(3)).await?.is_none());
        assert_that!(store.segment_count(), eq(0));
        Ok(())
    }

    #[test(tokio::test)]
    async fn cursor_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t");
        let cursor = {
            let store = TargetStore::open(&path, TARGET).await?;
            append(&store, &["a", "b", "c"]).await?;
            let cursor = DispatchCursor {
                segment: SegmentId::OLDEST,
                offset: frame("a", 60).len() as u64,
                records: 1,
            };
            store.set_cursor(cursor);
            store.persist_cursor().await?;
            cursor
        };

        let store = TargetStore::open(&path, TARGET).await?;
        assert_that!(store.cursor(), eq(cursor));
        assert_that!(store.pending_count(), eq(2));
        Ok(())
    }

    #[test(tokio::test)]
    async fn cursor_into_a_deleted_segment_moves_forward() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t");
        {
            let store = TargetStore::open(&path, TARGET).await?;
            append(&store, &["a"]).await?;
            append(&store, &["b"]).await?;
            store.set_cursor(DispatchCursor {
                segment: SegmentId::OLDEST,
                offset: 1,
                records: 1,
            });
            store.persist_cursor().await?;
            store.discard(SegmentId::OLDEST).await?;
        }

        let store = TargetStore::open(&path, TARGET).await?;
        assert_that!(
            store.cursor(),
            eq(DispatchCursor::start_of(SegmentId::new(2)))
        );
        assert_that!(store.pending_count(), eq(1));
        Ok(())
    }

    #[test(tokio::test)]
    async fn expired_prefix_is_discarded_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::open(dir.path().join("t"), TARGET).await?;
        for max_expires_at in [100, 500, 200] {
            let f = frame("x", 1);
            store
                .append(&[&f[..]], 1, MillisSinceEpoch::new(max_expires_at))
                .await?;
        }

        let expired = store.discard_expired(MillisSinceEpoch::new(300)).await?;
        let ids: Vec<_> = expired.iter().map(|s| s.id).collect();
        // the third segment expired as well, but a live segment precedes it
        assert_eq!(vec![SegmentId::new(1)], ids);
        assert_that!(store.segment_count(), eq(2));

        let expired = store.discard_expired(MillisSinceEpoch::new(500)).await?;
        assert_that!(expired.len(), eq(2));
        Ok(())
    }

    #[test(tokio::test)]
    async fn destroyed_store_refuses_appends() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t");
        let store = TargetStore::open(&path, TARGET).await?;
        append(&store, &["a"]).await?;

        store.destroy().await?;
        assert!(!path.exists());
        assert!(store.is_destroyed());
        assert!(matches!(
            append(&store, &["b"]).await,
            Err(StoreError::Retired(t)) if t == TARGET
        ));
        // destroying twice is fine
        store.destroy().await?;
        Ok(())
    }

    #[test(tokio::test)]
    async fn truncate_moves_cursor_past_everything() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = TargetStore::open(dir.path().join("t"), TARGET).await?;
        append(&store, &["a", "b"]).await?;
        append(&store, &["c"]).await?;

        assert_that!(store.truncate().await?.len(), eq(2));
        assert_that!(store.pending_count(), eq(0));
        assert_that!(
            store.cursor(),
            eq(DispatchCursor::start_of(SegmentId::new(3)))
        );

        append(&store, &["d"]).await?;
        assert_that!(store.pending_count(), eq(1));
        Ok(())
    }
}
