//! Writer queue and sequencer.
//!
//! Items arrive from any number of producers in any order; the writer thread
//! may only commit the item whose key immediately follows the last committed
//! one. Everything here is plain data, guarded by the writer's single mutex.

use crate::frame::FrameKey;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// How a queued frame should be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// A frame with encoded data.
    Full,
    /// A frame whose data is already in the asset from a previous run.
    Fake,
    /// A copy of the last frame written for the same eyes.
    Repeat,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Full => write!(f, "FULL"),
            QueueKind::Fake => write!(f, "FAKE"),
            QueueKind::Repeat => write!(f, "REPEAT"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub kind: QueueKind,
    pub key: FrameKey,
    /// Encoded data for FULL items, `None` once spilled to disk.
    pub payload: Option<Bytes>,
    /// Byte count; the only data a FAKE item carries.
    pub size: u64,
}

impl QueueItem {
    pub fn full(key: FrameKey, payload: Bytes) -> Self {
        let size = payload.len() as u64;
        Self {
            kind: QueueKind::Full,
            key,
            payload: Some(payload),
            size,
        }
    }

    pub fn fake(key: FrameKey, size: u64) -> Self {
        Self {
            kind: QueueKind::Fake,
            key,
            payload: None,
            size,
        }
    }

    pub fn repeat(key: FrameKey) -> Self {
        Self {
            kind: QueueKind::Repeat,
            key,
            payload: None,
            size: 0,
        }
    }

    fn is_resident_full(&self) -> bool {
        self.kind == QueueKind::Full && self.payload.is_some()
    }
}

/// Why an item could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    AlreadyCommitted,
    AlreadyQueued,
}

/// Queue contents plus the writer bookkeeping that shares its lock.
#[derive(Debug)]
pub struct WriterState {
    queue: BTreeMap<FrameKey, QueueItem>,
    resident_full_count: usize,
    last_committed: Option<FrameKey>,
    maximum_frames_in_memory: usize,
    stereoscopic: bool,
    /// One-way: set by `finish`, never cleared.
    pub finish_requested: bool,
    /// The writer thread has exited and will commit nothing more.
    pub stopped: bool,
    /// The writer thread exited with an error.
    pub failed: bool,
}

impl WriterState {
    pub fn new(maximum_frames_in_memory: usize, stereoscopic: bool) -> Self {
        Self {
            queue: BTreeMap::new(),
            resident_full_count: 0,
            last_committed: None,
            maximum_frames_in_memory: maximum_frames_in_memory.max(1),
            stereoscopic,
            finish_requested: false,
            stopped: false,
            failed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn resident_full_count(&self) -> usize {
        self.resident_full_count
    }

    pub fn maximum_frames_in_memory(&self) -> usize {
        self.maximum_frames_in_memory
    }

    pub fn set_maximum_frames_in_memory(&mut self, frames: usize) {
        self.maximum_frames_in_memory = frames.max(1);
    }

    pub fn last_committed(&self) -> Option<FrameKey> {
        self.last_committed
    }

    /// More FULL payloads are resident than the bound allows.
    pub fn over_bound(&self) -> bool {
        self.resident_full_count > self.maximum_frames_in_memory
    }

    /// The key the writer must commit next.
    pub fn next_key(&self) -> FrameKey {
        self.last_committed
            .map(FrameKey::successor)
            .unwrap_or_else(|| FrameKey::first(self.stereoscopic))
    }

    /// The lowest queued item is the immediate successor of the last commit.
    pub fn has_sequenced_head(&self) -> bool {
        self.queue
            .first_key_value()
            .map_or(false, |(key, _)| *key == self.next_key())
    }

    pub fn insert(&mut self, item: QueueItem) -> Result<(), Rejected> {
        if self.last_committed.map_or(false, |last| item.key <= last) {
            return Err(Rejected::AlreadyCommitted);
        }
        if self.queue.contains_key(&item.key) {
            return Err(Rejected::AlreadyQueued);
        }
        if item.is_resident_full() {
            self.resident_full_count += 1;
        }
        self.queue.insert(item.key, item);
        Ok(())
    }

    /// Remove the head if it is sequenced.
    pub fn pop_sequenced(&mut self) -> Option<QueueItem> {
        if !self.has_sequenced_head() {
            return None;
        }
        let (_, item) = self.queue.pop_first()?;
        if item.is_resident_full() {
            self.resident_full_count -= 1;
        }
        Some(item)
    }

    pub fn mark_committed(&mut self, key: FrameKey) {
        self.last_committed = Some(key);
    }

    /// Detach the payload of the highest-keyed resident FULL item.
    ///
    /// The item stays queued without a payload. It is still counted as
    /// resident until [`WriterState::spill_done`] is called.
    pub fn take_spill_candidate(&mut self) -> Option<(FrameKey, Bytes)> {
        self.queue
            .values_mut()
            .rev()
            .find(|item| item.is_resident_full())
            .and_then(|item| item.payload.take().map(|payload| (item.key, payload)))
    }

    pub fn spill_done(&mut self) {
        self.resident_full_count = self.resident_full_count.saturating_sub(1);
    }

    /// Log everything left in the queue when the writer gives up on it.
    pub fn log_abandoned(&self) {
        warn!(
            remaining = self.queue.len(),
            last_committed = ?self.last_committed,
            "writer finishing with unwritten frames"
        );
        for item in self.queue.values() {
            warn!(kind = %item.kind, key = %item.key, size = item.size, "abandoned frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Eyes;
    use proptest::prelude::*;

    fn key(frame: u64) -> FrameKey {
        FrameKey::new(frame, Eyes::Both)
    }

    fn full(frame: u64) -> QueueItem {
        QueueItem::full(key(frame), Bytes::from(vec![frame as u8; 4]))
    }

    fn drain(state: &mut WriterState) -> Vec<FrameKey> {
        let mut out = Vec::new();
        while let Some(item) = state.pop_sequenced() {
            state.mark_committed(item.key);
            out.push(item.key);
        }
        out
    }

    #[test]
    fn test_head_not_sequenced_until_gap_filled() {
        let mut state = WriterState::new(8, false);
        for f in [5, 4, 3] {
            state.insert(full(f)).unwrap();
        }
        assert!(!state.has_sequenced_head());
        assert!(drain(&mut state).is_empty());

        for f in 0..3 {
            state.insert(QueueItem::fake(key(f), 100)).unwrap();
        }
        assert!(state.has_sequenced_head());
        assert_eq!(drain(&mut state), (0..6).map(key).collect::<Vec<_>>());
        assert_eq!(state.resident_full_count(), 0);
    }

    #[test]
    fn test_stereo_sequence_alternates_eyes() {
        let mut state = WriterState::new(8, true);
        state.insert(QueueItem::repeat(FrameKey::new(1, Eyes::Left))).unwrap();
        state.insert(QueueItem::fake(FrameKey::new(0, Eyes::Right), 1)).unwrap();
        assert!(!state.has_sequenced_head());

        state.insert(QueueItem::fake(FrameKey::new(0, Eyes::Left), 1)).unwrap();
        assert_eq!(
            drain(&mut state),
            vec![
                FrameKey::new(0, Eyes::Left),
                FrameKey::new(0, Eyes::Right),
                FrameKey::new(1, Eyes::Left),
            ]
        );
        assert_eq!(state.next_key(), FrameKey::new(1, Eyes::Right));
    }

    #[test]
    fn test_rejects_duplicates_and_committed_keys() {
        let mut state = WriterState::new(8, false);
        state.insert(full(0)).unwrap();
        assert_eq!(state.insert(full(0)), Err(Rejected::AlreadyQueued));
        drain(&mut state);
        assert_eq!(state.insert(full(0)), Err(Rejected::AlreadyCommitted));
        assert_eq!(state.resident_full_count(), 0);
    }

    #[test]
    fn test_spill_candidate_is_highest_resident_full() {
        let mut state = WriterState::new(1, false);
        state.insert(full(3)).unwrap();
        state.insert(full(7)).unwrap();
        state.insert(QueueItem::repeat(key(9))).unwrap();
        assert!(state.over_bound());

        let (spilled, payload) = state.take_spill_candidate().unwrap();
        assert_eq!(spilled, key(7));
        assert_eq!(payload.len(), 4);
        assert_eq!(state.resident_full_count(), 2);
        state.spill_done();
        assert!(!state.over_bound());

        // The spilled item is still queued, now without a payload
        assert_eq!(state.len(), 3);
        let (next, _) = state.take_spill_candidate().unwrap();
        assert_eq!(next, key(3));
        state.spill_done();
        assert!(state.take_spill_candidate().is_none());
    }

    #[test]
    fn test_popping_spilled_item_does_not_touch_resident_count() {
        let mut state = WriterState::new(1, false);
        state.insert(full(0)).unwrap();
        state.insert(full(1)).unwrap();
        state.take_spill_candidate().unwrap();
        state.spill_done();
        assert_eq!(state.resident_full_count(), 1);

        let first = state.pop_sequenced().unwrap();
        state.mark_committed(first.key);
        assert_eq!(state.resident_full_count(), 0);
        let second = state.pop_sequenced().unwrap();
        assert!(second.payload.is_none());
        assert_eq!(state.resident_full_count(), 0);
    }

    proptest! {
        // Whatever the arrival order, draining yields keys in ascending order
        // and only once every earlier key is present.
        #[test]
        fn prop_drain_order_is_monotonic(
            order in Just((0u64..40).collect::<Vec<_>>()).prop_shuffle(),
            stereo in proptest::bool::ANY,
        ) {
            let mut state = WriterState::new(4, stereo);
            let mut committed = Vec::new();
            for f in order {
                let keys = if stereo {
                    vec![FrameKey::new(f, Eyes::Right), FrameKey::new(f, Eyes::Left)]
                } else {
                    vec![key(f)]
                };
                for k in keys {
                    state.insert(QueueItem::fake(k, 1)).unwrap();
                    committed.extend(drain(&mut state));
                }
            }
            prop_assert!(state.is_empty());
            prop_assert!(committed.windows(2).all(|w| w[1] == w[0].successor()));
            prop_assert_eq!(committed.len(), if stereo { 80 } else { 40 });
        }
    }
}
