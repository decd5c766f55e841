// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use bytes::{Buf, Bytes};
use tracing::{trace, warn};

use handoff_types::hint::HintRecord;

use crate::cursor::DispatchCursor;
use crate::segment::{SegmentId, read_segment};
use crate::target_store::TargetStore;
use crate::{Result, StoreError};

/// Where a replayed record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub segment: SegmentId,
    /// The cursor to resume from once this record has been handled. Points at the start of
    /// the following segment if this was the last record of `segment`.
    pub next: DispatchCursor,
}

impl RecordPosition {
    pub fn completes_segment(&self) -> bool {
        self.next.segment > self.segment
    }
}

struct LoadedSegment {
    id: SegmentId,
    len: usize,
    body: Bytes,
}

/// Replays a target's records in order, one segment in memory at a time.
///
/// The reader ends (`Ok(None)`) once it has caught up with the store, but it can be polled
/// again later to pick up segments appended in the meantime. Segments deleted under the
/// reader's feet are skipped.
pub struct HintReader {
    store: Arc<TargetStore>,
    position: DispatchCursor,
    current: Option<LoadedSegment>,
}

impl HintReader {
    pub(crate) fn new(store: Arc<TargetStore>, position: DispatchCursor) -> Self {
        Self {
            store,
            position,
            current: None,
        }
    }

    /// The position of the next record this reader returns.
    pub fn position(&self) -> DispatchCursor {
        self.position
    }

    pub async fn next(&mut self) -> Result<Option<(RecordPosition, HintRecord)>> {
        loop {
            if let Some(segment) = &mut self.current {
                if segment.body.has_remaining() {
                    match HintRecord::decode(&mut segment.body) {
                        Ok(hint) => {
                            let id = segment.id;
                            self.position = if segment.body.has_remaining() {
                                DispatchCursor {
                                    segment: id,
                                    offset: (segment.len - segment.body.remaining()) as u64,
                                    records: self.position.records + 1,
                                }
                            } else {
                                self.current = None;
                                DispatchCursor::start_of(id.next())
                            };
                            let position = RecordPosition {
                                segment: id,
                                next: self.position,
                            };
                            return Ok(Some((position, hint)));
                        }
                        Err(err) => {
                            warn!(
                                target = %self.store.target(),
                                segment = %segment.id,
                                offset = self.position.offset,
                                %err,
                                "Skipping the rest of a segment holding an undecodable record"
                            );
                        }
                    }
                }
                let id = segment.id;
                self.current = None;
                self.position = DispatchCursor::start_of(id.next());
                continue;
            }

            let Some(meta) = self.store.next_segment(self.position.segment) else {
                return Ok(None);
            };
            if meta.id != self.position.segment {
                self.position = DispatchCursor::start_of(meta.id);
            }

            match read_segment(&self.store.segment_file(meta.id)).await {
                Ok((_, mut body)) => {
                    let len = body.len();
                    let offset = self.position.offset as usize;
                    if offset > len {
                        warn!(
                            target = %self.store.target(),
                            segment = %meta.id,
                            offset,
                            "Dispatch cursor lies beyond the end of the segment, skipping it"
                        );
                        self.position = DispatchCursor::start_of(meta.id.next());
                        continue;
                    }
                    body.advance(offset);
                    trace!(
                        target = %self.store.target(),
                        segment = %meta.id,
                        offset,
                        "Replaying segment"
                    );
                    self.current = Some(LoadedSegment {
                        id: meta.id,
                        len,
                        body,
                    });
                }
                Err(err) if err.is_not_found() => {
                    // expired or evicted concurrently
                    trace!(target = %self.store.target(), segment = %meta.id, "Segment vanished");
                    self.position = DispatchCursor::start_of(meta.id.next());
                }
                Err(err @ StoreError::Corrupted { .. }) => {
                    warn!(target = %self.store.target(), segment = %meta.id, %err, "Skipping corrupted segment");
                    self.position = DispatchCursor::start_of(meta.id.next());
                }
                Err(err) => return Err(err),
            }
        }
    }
}
