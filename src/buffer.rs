use crate::config::AcquisitionConfig;
use crate::error::{PlateError, PlateResult};
use crate::types::SessionData;
use ndarray::{Array2, ArrayView2};
use std::collections::VecDeque;

/// Bounded session history of timestamps and per-channel forces.
///
/// All buffers hold the same number of samples at all times; when the bound
/// is exceeded the oldest samples of every buffer are dropped together.
/// Samples are addressed by an absolute index counted from the start of the
/// session, so an index handed out earlier stays meaningful after eviction.
pub struct BufferManager {
    num_channels: usize,
    max_samples: usize,
    time: VecDeque<f64>,
    channels: Vec<VecDeque<f64>>,
    /// Samples dropped off the front since the last reset
    evicted: usize,
}

impl BufferManager {
    pub fn new(config: &AcquisitionConfig) -> Self {
        let max_samples =
            ((config.buffer_max_duration_s * config.sample_rate_hz) as usize).max(1);
        Self::with_capacity(config.num_channels, max_samples)
    }

    pub fn with_capacity(num_channels: usize, max_samples: usize) -> Self {
        BufferManager {
            num_channels,
            max_samples,
            time: VecDeque::with_capacity(max_samples.min(65_536)),
            channels: (0..num_channels)
                .map(|_| VecDeque::with_capacity(max_samples.min(65_536)))
                .collect(),
            evicted: 0,
        }
    }

    /// Clear all history
    pub fn reset(&mut self) {
        self.time.clear();
        for ch in &mut self.channels {
            ch.clear();
        }
        self.evicted = 0;
    }

    /// Append a chunk of `n` timestamps and an `(n, channels)` force block.
    /// Nothing is appended when the shapes disagree.
    pub fn append_chunk(&mut self, time: &[f64], forces: ArrayView2<f64>) -> PlateResult<()> {
        if forces.ncols() != self.num_channels {
            return Err(PlateError::ShapeMismatch {
                expected: self.num_channels,
                got: forces.ncols(),
            });
        }
        if forces.nrows() != time.len() {
            return Err(PlateError::InvalidParameters(format!(
                "{} timestamps for {} force rows",
                time.len(),
                forces.nrows()
            )));
        }

        self.time.extend(time.iter().copied());
        for (c, ch) in self.channels.iter_mut().enumerate() {
            ch.extend(forces.column(c).iter().copied());
        }

        let overflow = self.time.len().saturating_sub(self.max_samples);
        if overflow > 0 {
            self.time.drain(..overflow);
            for ch in &mut self.channels {
                ch.drain(..overflow);
            }
            self.evicted += overflow;
        }
        Ok(())
    }

    /// Number of samples currently held
    pub fn get_buffer_size(&self) -> usize {
        self.time.len()
    }

    /// Absolute index of the oldest retained sample
    pub fn first_index(&self) -> usize {
        self.evicted
    }

    /// Total samples appended since reset; the next sample gets this index
    pub fn total_appended(&self) -> usize {
        self.evicted + self.time.len()
    }

    fn position(&self, abs_index: usize) -> Option<usize> {
        let pos = abs_index.checked_sub(self.evicted)?;
        (pos < self.time.len()).then_some(pos)
    }

    pub fn time_at(&self, abs_index: usize) -> Option<f64> {
        self.position(abs_index).map(|p| self.time[p])
    }

    pub fn summed_force_at(&self, abs_index: usize) -> Option<f64> {
        self.position(abs_index)
            .map(|p| self.channels.iter().map(|ch| ch[p]).sum())
    }

    pub fn latest_time(&self) -> Option<f64> {
        self.time.back().copied()
    }

    /// Absolute index of the retained sample whose timestamp is nearest `t`
    pub fn index_nearest_time(&self, t: f64) -> Option<usize> {
        if self.time.is_empty() {
            return None;
        }
        let p = self.time.partition_point(|&x| x < t);
        let pos = if p == 0 {
            0
        } else if p >= self.time.len() {
            self.time.len() - 1
        } else if (self.time[p] - t).abs() < (t - self.time[p - 1]).abs() {
            p
        } else {
            p - 1
        };
        Some(self.evicted + pos)
    }

    /// Copy of everything held, `None` when empty
    pub fn get_full_data(&self) -> Option<SessionData> {
        self.copy_range(0, self.time.len())
    }

    /// Suffix of the history whose timestamps lie within `duration_s` of the newest sample
    pub fn get_recent_data(&self, duration_s: f64) -> Option<SessionData> {
        let last = self.latest_time()?;
        let start = self.time.partition_point(|&t| t < last - duration_s);
        self.copy_range(start, self.time.len())
    }

    /// The last `n` summed-force samples, `None` if fewer are held
    pub fn get_summed_force_history(&self, n: usize) -> Option<Vec<f64>> {
        let len = self.time.len();
        if n == 0 || len < n {
            return None;
        }
        Some((len - n..len).map(|p| self.summed_at_position(p)).collect())
    }

    /// Timestamps and summed force for absolute indices `[start, end)`,
    /// clamped to what is still retained
    pub fn summed_range(&self, abs_start: usize, abs_end: usize) -> Option<(Vec<f64>, Vec<f64>)> {
        let start = abs_start.max(self.evicted) - self.evicted;
        let end = abs_end.min(self.total_appended()).saturating_sub(self.evicted);
        if start >= end {
            return None;
        }
        let time = self.time.range(start..end).copied().collect();
        let force = (start..end).map(|p| self.summed_at_position(p)).collect();
        Some((time, force))
    }

    fn summed_at_position(&self, pos: usize) -> f64 {
        self.channels.iter().map(|ch| ch[pos]).sum()
    }

    fn copy_range(&self, start: usize, end: usize) -> Option<SessionData> {
        if start >= end {
            return None;
        }
        let n = end - start;
        let time: Vec<f64> = self.time.range(start..end).copied().collect();
        let forces = Array2::from_shape_fn((n, self.num_channels), |(r, c)| {
            self.channels[c][start + r]
        });
        Some(SessionData { time, forces })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn chunk(start: usize, n: usize, value: f64) -> (Vec<f64>, Array2<f64>) {
        let time = (start..start + n).map(|i| i as f64 * 0.001).collect();
        (time, Array2::from_elem((n, 4), value))
    }

    #[test]
    fn test_append_and_sum() {
        let mut buf = BufferManager::with_capacity(4, 1000);
        let (t, f) = chunk(0, 100, 25.0);
        buf.append_chunk(&t, f.view()).unwrap();

        assert_eq!(buf.get_buffer_size(), 100);
        let hist = buf.get_summed_force_history(10).unwrap();
        assert_eq!(hist.len(), 10);
        assert!(hist.iter().all(|&v| v == 100.0));
        assert!(buf.get_summed_force_history(101).is_none());
    }

    #[test]
    fn test_shape_mismatch_leaves_buffer_untouched() {
        let mut buf = BufferManager::with_capacity(4, 1000);
        let bad = Array2::<f64>::zeros((10, 3));
        let t = vec![0.0; 10];
        let err = buf.append_chunk(&t, bad.view()).unwrap_err();
        assert!(matches!(err, PlateError::ShapeMismatch { expected: 4, got: 3 }));
        assert_eq!(buf.get_buffer_size(), 0);
        assert!(buf.get_full_data().is_none());
    }

    #[test]
    fn test_bounded_with_absolute_indices() {
        let mut buf = BufferManager::with_capacity(4, 250);
        for k in 0..5 {
            let (t, f) = chunk(k * 100, 100, k as f64);
            buf.append_chunk(&t, f.view()).unwrap();
            assert!(buf.get_buffer_size() <= 250);
        }
        assert_eq!(buf.get_buffer_size(), 250);
        assert_eq!(buf.total_appended(), 500);
        assert_eq!(buf.first_index(), 250);

        // evicted samples are gone, retained ones keep their index
        assert!(buf.time_at(249).is_none());
        assert_eq!(buf.summed_force_at(250), Some(8.0));
        assert_eq!(buf.summed_force_at(499), Some(16.0));
        assert!(buf.summed_force_at(500).is_none());

        let full = buf.get_full_data().unwrap();
        assert_eq!(full.time.len(), full.forces.nrows());
    }

    #[test]
    fn test_recent_data_and_nearest_time() {
        let mut buf = BufferManager::with_capacity(4, 1000);
        let (t, f) = chunk(0, 500, 10.0);
        buf.append_chunk(&t, f.view()).unwrap();

        let recent = buf.get_recent_data(0.1005).unwrap();
        assert_eq!(recent.len(), 101);
        assert_eq!(recent.summed()[0], 40.0);

        assert_eq!(buf.index_nearest_time(0.2004), Some(200));
        assert_eq!(buf.index_nearest_time(-5.0), Some(0));
        assert_eq!(buf.index_nearest_time(99.0), Some(499));
    }

    #[test]
    fn test_reset_empties() {
        let mut buf = BufferManager::with_capacity(4, 1000);
        let (t, f) = chunk(0, 10, 1.0);
        buf.append_chunk(&t, f.view()).unwrap();
        buf.reset();
        assert_eq!(buf.get_buffer_size(), 0);
        assert_eq!(buf.total_appended(), 0);
        assert!(buf.get_recent_data(1.0).is_none());
    }
}
