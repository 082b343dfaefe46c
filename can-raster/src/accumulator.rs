//! Time-series accumulation
//!
//! Collects `(timestamp, value)` pairs per decoded signal across one log
//! file. Pending samples are frozen into boxed chunks at every flush so the
//! growing vectors stay small; `finish` concatenates the chunks into one
//! `SignalSeries` per signal.

use crate::config::default_step;
use crate::raster::resource_error;
use crate::types::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// All samples of one signal, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSeries {
    pub name: String,
    pub timestamps: Vec<f64>,
    pub values: Vec<f64>,
}

impl SignalSeries {
    pub fn new(name: impl Into<String>, timestamps: Vec<f64>, values: Vec<f64>) -> Self {
        debug_assert_eq!(timestamps.len(), values.len());
        Self {
            name: name.into(),
            timestamps,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[derive(Debug, Default)]
struct SeriesSlot {
    name: String,
    pending_times: Vec<f64>,
    pending_values: Vec<f64>,
    chunks: Vec<(Box<[f64]>, Box<[f64]>)>,
}

impl SeriesSlot {
    fn freeze(&mut self) {
        if self.pending_times.is_empty() {
            return;
        }
        let times = std::mem::take(&mut self.pending_times).into_boxed_slice();
        let values = std::mem::take(&mut self.pending_values).into_boxed_slice();
        self.chunks.push((times, values));
    }

    fn sample_count(&self) -> usize {
        self.pending_times.len() + self.chunks.iter().map(|(t, _)| t.len()).sum::<usize>()
    }
}

/// Per-file sample collector
#[derive(Debug)]
pub struct SeriesAccumulator {
    filter: Option<BTreeSet<String>>,
    remap: Option<BTreeMap<String, String>>,
    batch_size: usize,
    step: f64,
    frames_since_flush: usize,
    flushes: usize,
    index: HashMap<String, usize>,
    slots: Vec<SeriesSlot>,
}

impl SeriesAccumulator {
    /// Create an accumulator flushing every `batch_size` frames
    pub fn new(batch_size: usize) -> Self {
        Self {
            filter: None,
            remap: None,
            batch_size: batch_size.max(1),
            step: default_step(),
            frames_since_flush: 0,
            flushes: 0,
            index: HashMap::new(),
            slots: Vec::new(),
        }
    }

    /// Keep only these decoded signal names
    pub fn with_filter(mut self, filter: Option<BTreeSet<String>>) -> Self {
        self.filter = filter;
        self
    }

    /// Rename decoded signals when finishing
    pub fn with_remap(mut self, remap: Option<BTreeMap<String, String>>) -> Self {
        self.remap = remap;
        self
    }

    /// Raster step the series are headed for, used in out-of-memory hints
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    /// True if a decoded name passes the filter
    pub fn accepts(&self, name: &str) -> bool {
        self.filter.as_ref().map_or(true, |f| f.contains(name))
    }

    /// Record one decoded value; filtered names are dropped
    pub fn push(&mut self, name: &str, timestamp: f64, value: f64) {
        if !self.accepts(name) {
            return;
        }

        let idx = match self.index.get(name) {
            Some(&idx) => idx,
            None => {
                let idx = self.slots.len();
                self.slots.push(SeriesSlot {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.index.insert(name.to_string(), idx);
                idx
            }
        };

        let slot = &mut self.slots[idx];
        slot.pending_times.push(timestamp);
        slot.pending_values.push(value);
    }

    /// Count one frame; returns true if this frame triggered a flush
    pub fn end_frame(&mut self) -> bool {
        self.frames_since_flush += 1;
        if self.frames_since_flush >= self.batch_size {
            self.flush();
            true
        } else {
            false
        }
    }

    /// Freeze all pending samples into chunks
    pub fn flush(&mut self) {
        for slot in &mut self.slots {
            slot.freeze();
        }
        self.frames_since_flush = 0;
        self.flushes += 1;
        log::trace!("Flushed batch {} ({} signals)", self.flushes, self.slots.len());
    }

    /// Number of signals seen so far
    pub fn signal_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of samples held across all signals
    pub fn data_points(&self) -> usize {
        self.slots.iter().map(SeriesSlot::sample_count).sum()
    }

    /// Concatenate every signal's chunks, applying the rename table
    ///
    /// Series come out in first-seen order. A rename whose target collides
    /// with another stored signal keeps the decoded name. Fails with
    /// `ResourceExhausted` if the concatenated buffers cannot be allocated.
    pub fn finish(mut self) -> Result<Vec<SignalSeries>> {
        self.flush();

        let decoded: BTreeSet<String> = self.slots.iter().map(|s| s.name.clone()).collect();
        let mut taken: BTreeSet<String> = BTreeSet::new();
        let mut series = Vec::with_capacity(self.slots.len());

        for slot in self.slots {
            let target = self
                .remap
                .as_ref()
                .and_then(|m| m.get(&slot.name))
                .filter(|target| **target != slot.name);

            let name = match target {
                Some(target) if decoded.contains(target) || taken.contains(target) => {
                    log::warn!(
                        "Cannot rename '{}' to '{}': name already used by another signal, keeping '{}'",
                        slot.name,
                        target,
                        slot.name
                    );
                    slot.name
                }
                Some(target) => target.clone(),
                None => slot.name,
            };
            taken.insert(name.clone());

            let total = slot.chunks.iter().map(|(t, _)| t.len()).sum();
            let (mut timestamps, mut values) = reserve_samples(total, self.step)?;
            for (t, v) in slot.chunks {
                timestamps.extend_from_slice(&t);
                values.extend_from_slice(&v);
            }

            series.push(SignalSeries::new(name, timestamps, values));
        }

        Ok(series)
    }
}

fn reserve_samples(total: usize, step: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    let estimated_mb = total as f64 * 2.0 * std::mem::size_of::<f64>() as f64 / 1024.0 / 1024.0;
    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    timestamps
        .try_reserve_exact(total)
        .map_err(|_| resource_error(estimated_mb, step))?;
    values
        .try_reserve_exact(total)
        .map_err(|_| resource_error(estimated_mb, step))?;
    Ok((timestamps, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PipelineError;

    #[test]
    fn test_chunks_concatenate_in_order() {
        let mut acc = SeriesAccumulator::new(2);
        for i in 0..5 {
            acc.push("Speed", i as f64, i as f64 * 10.0);
            acc.end_frame();
        }

        let series = acc.finish().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].timestamps, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(series[0].values, vec![0.0, 10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_flush_every_batch() {
        let mut acc = SeriesAccumulator::new(3);
        let flushes: Vec<bool> = (0..6).map(|_| acc.end_frame()).collect();
        assert_eq!(flushes, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_filter_applies_to_decoded_name() {
        let filter: BTreeSet<String> = ["A".to_string()].into_iter().collect();
        let remap: BTreeMap<String, String> = [("A".to_string(), "Renamed".to_string())]
            .into_iter()
            .collect();
        let mut acc = SeriesAccumulator::new(10)
            .with_filter(Some(filter))
            .with_remap(Some(remap));

        acc.push("A", 0.0, 1.0);
        acc.push("B", 0.0, 2.0);
        assert_eq!(acc.data_points(), 1);

        let series = acc.finish().unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name, "Renamed");
    }

    #[test]
    fn test_rename_collision_keeps_decoded_name() {
        let remap: BTreeMap<String, String> = [("A".to_string(), "B".to_string())]
            .into_iter()
            .collect();
        let mut acc = SeriesAccumulator::new(10).with_remap(Some(remap));
        acc.push("A", 0.0, 1.0);
        acc.push("B", 0.0, 2.0);

        let names: Vec<String> = acc.finish().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_two_renames_to_same_target() {
        let remap: BTreeMap<String, String> = [
            ("A".to_string(), "X".to_string()),
            ("B".to_string(), "X".to_string()),
        ]
        .into_iter()
        .collect();
        let mut acc = SeriesAccumulator::new(10).with_remap(Some(remap));
        acc.push("A", 0.0, 1.0);
        acc.push("B", 0.0, 2.0);

        let names: Vec<String> = acc.finish().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["X".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_failed_reservation_is_resource_exhausted() {
        let err = reserve_samples(usize::MAX, 0.02).unwrap_err();
        match err {
            PipelineError::ResourceExhausted { suggested_step, .. } => {
                assert!((suggested_step - 0.1).abs() < 1e-12);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_reserve_samples_fits() {
        let (t, v) = reserve_samples(16, 0.02).unwrap();
        assert!(t.capacity() >= 16 && v.capacity() >= 16);
    }
}
