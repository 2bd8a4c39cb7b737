//! Time-series assembly.
//!
//! Combines calibrated voltages, a uniform time base and the sparse sync
//! pulse indices into one record per sample.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One acquired sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRecord {
    /// Seconds since the first sample
    #[serde(rename = "time_s")]
    pub time: f64,
    /// Offset-corrected voltage in volts
    #[serde(rename = "voltage_v")]
    pub voltage: f64,
    /// True when an external reference pulse was recorded at this sample
    pub sync: bool,
}

/// Strictly increasing sample indices at which reference pulses occurred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncEventSet {
    indices: Vec<usize>,
}

impl SyncEventSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw decoded indices, keeping only those in
    /// `[0, n_samples)`. Out-of-window values (including negative ones) are
    /// noise from pulses recorded after the sample window closed and are
    /// dropped, as are duplicates.
    pub fn from_raw(raw: &[i64], n_samples: usize) -> Self {
        let indices: BTreeSet<usize> = raw
            .iter()
            .filter_map(|&i| usize::try_from(i).ok())
            .filter(|&i| i < n_samples)
            .collect();
        Self {
            indices: indices.into_iter().collect(),
        }
    }

    /// Number of events in the window.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True when no event fell in the window.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// True if a pulse was recorded at `index`.
    pub fn contains(&self, index: usize) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    /// Indices in increasing order.
    pub fn as_slice(&self) -> &[usize] {
        &self.indices
    }

    /// Dense flag vector of length `n_samples`.
    pub fn to_bitmap(&self, n_samples: usize) -> Vec<bool> {
        let mut bitmap = vec![false; n_samples];
        for &i in self.indices.iter().take_while(|&&i| i < n_samples) {
            bitmap[i] = true;
        }
        bitmap
    }
}

/// Align voltages with a uniform time base and the sync bitmap.
///
/// `time[i] = i / sampling_frequency`, `voltage[i] = voltages[i] - offset`,
/// `sync[i] = i ∈ sync_indices`. The output has exactly `voltages.len()`
/// records.
pub fn assemble(
    voltages: &[f64],
    sync_indices: &SyncEventSet,
    sampling_frequency: f64,
    offset: f64,
) -> Vec<TimeSeriesRecord> {
    let flags = sync_indices.to_bitmap(voltages.len());
    voltages
        .iter()
        .zip(flags)
        .enumerate()
        .map(|(i, (&voltage, sync))| TimeSeriesRecord {
            time: i as f64 / sampling_frequency,
            voltage: voltage - offset,
            sync,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 9765.65;

    #[test]
    fn test_length_matches_sample_count() {
        for n in [1usize, 10, 1000, 10_000] {
            let voltages = vec![0.5; n];
            let sync = SyncEventSet::from_raw(&[0, 3, 20_000], n);
            let records = assemble(&voltages, &sync, FS, 0.0);
            assert_eq!(records.len(), n);
        }
    }

    #[test]
    fn test_time_base_and_offset() {
        let records = assemble(&[1.0, 2.0, 3.0], &SyncEventSet::new(), 10.0, 0.5);
        assert_eq!(records[0].time, 0.0);
        assert!((records[2].time - 0.2).abs() < 1e-12);
        assert_eq!(records[1].voltage, 1.5);
        assert!(records.iter().all(|r| !r.sync));
    }

    #[test]
    fn test_sync_flags_follow_indices() {
        let sync = SyncEventSet::from_raw(&[1, 3], 5);
        let records = assemble(&[0.0; 5], &sync, FS, 0.0);
        let flags: Vec<bool> = records.iter().map(|r| r.sync).collect();
        assert_eq!(flags, vec![false, true, false, true, false]);
    }

    #[test]
    fn test_from_raw_drops_out_of_window_and_sorts() {
        let sync = SyncEventSet::from_raw(&[9, 2, -1, 2, 15, 4], 10);
        assert_eq!(sync.as_slice(), &[2, 4, 9]);
        assert!(sync.contains(4));
        assert!(!sync.contains(15));
        assert!(sync.as_slice().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_bitmap_ignores_indices_beyond_length() {
        let sync = SyncEventSet::from_raw(&[1, 8], 10);
        assert_eq!(sync.to_bitmap(4), vec![false, true, false, false]);
    }

    #[test]
    fn test_empty_voltages() {
        let sync = SyncEventSet::from_raw(&[0], 1);
        assert!(assemble(&[], &sync, FS, 0.0).is_empty());
    }
}
