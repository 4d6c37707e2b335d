//! The checkpoint document. One document covers every stream, so advancing the offsets of all
//! streams that fed a window is a single atomic write.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::StreamOffset;
use crate::schema::StreamKind;
use crate::window::WindowKey;

/// Path of the checkpoint document under the storage root.
pub const CHECKPOINT_PATH: &str = "_checkpoint/checkpoint.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Last durably committed sequence, per stream and partition.
    pub offsets: BTreeMap<StreamKind, BTreeMap<u16, i64>>,
    /// Windows already written whose input is not yet fully covered by `offsets`. On restart the
    /// replayed input of these windows is skipped instead of producing a partial re-emission.
    #[serde(default)]
    pub emitted: Vec<EmissionRecord>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmissionRecord {
    pub window: WindowKey,
    /// Highest input offset per stream partition.
    pub inputs: Vec<(StreamKind, StreamOffset)>,
}

impl Checkpoint {
    /// Committed offsets of one stream, per partition.
    pub fn stream_offsets(&self, stream: StreamKind) -> BTreeMap<u16, i64> {
        self.offsets.get(&stream).cloned().unwrap_or_default()
    }

    pub fn committed(&self, stream: StreamKind, partition: u16) -> Option<i64> {
        self.offsets
            .get(&stream)
            .and_then(|partitions| partitions.get(&partition))
            .copied()
    }

    /// Merges `offsets` in, keeping the maximum per partition. Returns the offsets that moved.
    pub fn merge_offsets(
        &mut self,
        offsets: &BTreeMap<StreamKind, BTreeMap<u16, i64>>,
    ) -> Vec<(StreamKind, StreamOffset)> {
        let mut advanced = Vec::new();
        for (stream, partitions) in offsets {
            let committed = self.offsets.entry(*stream).or_default();
            for (partition, sequence) in partitions {
                let current = committed.entry(*partition).or_insert(-1);
                if *sequence > *current {
                    *current = *sequence;
                    advanced.push((*stream, StreamOffset::new(*partition, *sequence)));
                }
            }
        }
        advanced
    }

    /// Remembers that `window` was written from `inputs`.
    pub fn record_emission(&mut self, window: &WindowKey, inputs: &[(StreamKind, StreamOffset)]) {
        let mut highest: BTreeMap<(StreamKind, u16), i64> = BTreeMap::new();
        for (stream, offset) in inputs {
            let entry = highest
                .entry((*stream, offset.partition))
                .or_insert(offset.sequence);
            *entry = (*entry).max(offset.sequence);
        }
        let inputs = highest
            .into_iter()
            .map(|((stream, partition), sequence)| (stream, StreamOffset::new(partition, sequence)))
            .collect();

        self.emitted.retain(|record| &record.window != window);
        self.emitted.push(EmissionRecord {
            window: window.clone(),
            inputs,
        });
    }

    /// Drops emission records whose input is entirely covered by the committed offsets, since that
    /// input will never be replayed. Returns the dropped windows.
    pub fn prune_emissions(&mut self) -> Vec<WindowKey> {
        let (covered, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.emitted)
                .into_iter()
                .partition(|record| {
                    record.inputs.iter().all(|(stream, offset)| {
                        self.committed(*stream, offset.partition)
                            .is_some_and(|committed| committed >= offset.sequence)
                    })
                });
        self.emitted = pending;
        covered.into_iter().map(|record| record.window).collect()
    }

    pub fn emitted_windows(&self) -> impl Iterator<Item = &WindowKey> {
        self.emitted.iter().map(|record| &record.window)
    }
}
