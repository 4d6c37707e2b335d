//! Tracks which consumed offsets are still needed for recovery. An offset is *held* while a window
//! it contributed to has not been durably written, or while its late-event record is pending. The
//! committable position of a partition is the highest offset below every held one: everything
//! at or before it can be skipped on restart without losing data.

use std::collections::BTreeMap;

use crate::checkpoint::Checkpoint;
use crate::message::StreamOffset;
use crate::schema::StreamKind;

#[derive(Debug, Clone, Default)]
struct PartitionProgress {
    highest_seen: Option<i64>,
    /// Held sequences with the number of outstanding holds.
    in_flight: BTreeMap<i64, u32>,
}

impl PartitionProgress {
    fn committable(&self) -> Option<i64> {
        match self.in_flight.keys().next() {
            Some(&lowest_held) => (lowest_held > 0).then(|| lowest_held - 1),
            None => self.highest_seen,
        }
    }
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<(StreamKind, u16), PartitionProgress>,
}

impl OffsetTracker {
    /// Resumes from the committed offsets of a checkpoint.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let partitions = checkpoint
            .offsets
            .iter()
            .flat_map(|(stream, partitions)| {
                partitions.iter().map(|(partition, sequence)| {
                    (
                        (*stream, *partition),
                        PartitionProgress {
                            highest_seen: Some(*sequence),
                            in_flight: BTreeMap::new(),
                        },
                    )
                })
            })
            .collect();
        Self { partitions }
    }

    /// Records that `offset` was consumed and is needed by `holds` pending writes. Observing and
    /// holding happen in one call so a concurrent commit never sees the offset unheld.
    pub fn track(&mut self, stream: StreamKind, offset: StreamOffset, holds: u32) {
        let progress = self
            .partitions
            .entry((stream, offset.partition))
            .or_default();
        if progress.highest_seen.is_none_or(|seen| offset.sequence > seen) {
            progress.highest_seen = Some(offset.sequence);
        }
        if holds > 0 {
            *progress.in_flight.entry(offset.sequence).or_default() += holds;
        }
    }

    /// Drops one hold of `offset`.
    pub fn release(&mut self, stream: StreamKind, offset: StreamOffset) {
        let Some(progress) = self.partitions.get_mut(&(stream, offset.partition)) else {
            return;
        };
        if let Some(holds) = progress.in_flight.get_mut(&offset.sequence) {
            *holds = holds.saturating_sub(1);
            if *holds == 0 {
                progress.in_flight.remove(&offset.sequence);
            }
        }
    }

    pub fn committable_offset(&self, stream: StreamKind, partition: u16) -> Option<i64> {
        self.partitions
            .get(&(stream, partition))
            .and_then(PartitionProgress::committable)
    }

    /// Committable position of every known partition.
    pub fn committable(&self) -> BTreeMap<StreamKind, BTreeMap<u16, i64>> {
        let mut offsets: BTreeMap<StreamKind, BTreeMap<u16, i64>> = BTreeMap::new();
        for ((stream, partition), progress) in &self.partitions {
            if let Some(sequence) = progress.committable() {
                offsets.entry(*stream).or_default().insert(*partition, sequence);
            }
        }
        offsets
    }

    /// Number of distinct held offsets.
    pub fn in_flight(&self) -> usize {
        self.partitions
            .values()
            .map(|progress| progress.in_flight.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V: StreamKind = StreamKind::Vehicle;

    #[test]
    fn test_commit_stops_below_held_offsets() {
        let mut tracker = OffsetTracker::default();
        tracker.track(V, StreamOffset::new(0, 0), 0);
        tracker.track(V, StreamOffset::new(0, 1), 1);
        tracker.track(V, StreamOffset::new(0, 2), 1);
        tracker.track(V, StreamOffset::new(0, 3), 0);

        assert_eq!(tracker.committable_offset(V, 0), Some(0));

        tracker.release(V, StreamOffset::new(0, 2));
        assert_eq!(tracker.committable_offset(V, 0), Some(0));

        tracker.release(V, StreamOffset::new(0, 1));
        assert_eq!(tracker.committable_offset(V, 0), Some(3));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_offset_held_by_several_windows() {
        let mut tracker = OffsetTracker::default();
        tracker.track(V, StreamOffset::new(1, 5), 2);
        assert_eq!(tracker.committable_offset(V, 1), Some(4));

        tracker.release(V, StreamOffset::new(1, 5));
        assert_eq!(tracker.committable_offset(V, 1), Some(4));
        tracker.release(V, StreamOffset::new(1, 5));
        assert_eq!(tracker.committable_offset(V, 1), Some(5));
    }

    #[test]
    fn test_nothing_committable_while_first_record_is_held() {
        let mut tracker = OffsetTracker::default();
        tracker.track(V, StreamOffset::new(0, 0), 1);
        assert_eq!(tracker.committable_offset(V, 0), None);
        assert!(tracker.committable().is_empty());
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let mut checkpoint = Checkpoint::default();
        checkpoint
            .offsets
            .entry(StreamKind::Weather)
            .or_default()
            .insert(0, 41);
        let mut tracker = OffsetTracker::from_checkpoint(&checkpoint);
        assert_eq!(tracker.committable_offset(StreamKind::Weather, 0), Some(41));

        tracker.track(StreamKind::Weather, StreamOffset::new(0, 42), 1);
        assert_eq!(tracker.committable_offset(StreamKind::Weather, 0), Some(41));
        assert_eq!(
            tracker.committable().get(&StreamKind::Weather),
            Some(&BTreeMap::from([(0, 41)]))
        );
    }
}
