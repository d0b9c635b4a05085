//! Per-epoch running statistics
//!
//! Named scalar accumulators in the spirit of an `AverageMeter`: each tracks
//! the latest value and a running (optionally windowed) average, and the set
//! is reset at every epoch boundary.

use std::collections::BTreeMap;
use std::collections::VecDeque;

/// One named scalar accumulator
#[derive(Debug, Clone)]
pub struct AverageMeter {
    /// Most recent value
    pub val: f64,
    sum: f64,
    count: usize,
    window: Option<VecDeque<(f64, usize)>>,
    window_size: usize,
}

impl AverageMeter {
    /// Full-history average
    pub fn new() -> Self {
        Self {
            val: 0.0,
            sum: 0.0,
            count: 0,
            window: None,
            window_size: 0,
        }
    }

    /// Windowed average over the last `window_size` updates
    pub fn windowed(window_size: usize) -> Self {
        Self {
            val: 0.0,
            sum: 0.0,
            count: 0,
            window: Some(VecDeque::with_capacity(window_size)),
            window_size,
        }
    }

    /// Record `value`, weighted by `n` samples
    pub fn update(&mut self, value: f64, n: usize) {
        self.val = value;
        self.sum += value * n as f64;
        self.count += n;
        if let Some(window) = &mut self.window {
            window.push_back((value, n));
            if window.len() > self.window_size {
                if let Some((old_value, old_n)) = window.pop_front() {
                    self.sum -= old_value * old_n as f64;
                    self.count -= old_n;
                }
            }
        }
    }

    /// Current average
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Number of samples accumulated
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Default for AverageMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// The named accumulator set for one epoch
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    meters: BTreeMap<String, AverageMeter>,
}

impl RunningStats {
    /// Empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` under `name`, weighted by `n` samples
    pub fn update(&mut self, name: &str, value: f64, n: usize) {
        self.meters
            .entry(name.to_string())
            .or_default()
            .update(value, n);
    }

    /// Average for one meter, if it was ever updated
    pub fn avg(&self, name: &str) -> Option<f64> {
        self.meters.get(name).map(AverageMeter::avg)
    }

    /// Render all averages as `name: value` pairs for the epoch summary line
    pub fn summary(&self) -> String {
        self.meters
            .iter()
            .map(|(name, meter)| format!("{name}: {:.5}", meter.avg()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    /// Drop all accumulators (epoch boundary)
    pub fn reset(&mut self) {
        self.meters.clear();
    }
}
