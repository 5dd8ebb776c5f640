//! Telemetry counter differentiation.

use std::time::Duration;

/// Turns periodically sampled free-running counters into per-second rates.
///
/// Base stations report 32-bit counters, nodes 16-bit ones; both wrap, so the
/// delta is computed with wraparound subtraction at the given width before
/// dividing by the sampling interval.
pub(crate) struct DeltaTracker {
    mask: u64,
    cur: Option<Vec<u64>>,
    last: Option<Vec<u64>>,
    delta: Option<Vec<f64>>,
}

impl DeltaTracker {
    /// `mask` is the counter width as a bit mask, eg. `0xFFFF` for 16-bit
    /// counters.
    pub fn new(mask: u64) -> Self {
        DeltaTracker {
            mask,
            cur: None,
            last: None,
            delta: None,
        }
    }

    /// Records the most recent counter sample.
    pub fn update(&mut self, counters: Vec<u64>) {
        self.cur = Some(counters);
    }

    /// Differentiates against the previous snapshot taken `interval` ago.
    ///
    /// Does nothing until a sample has been recorded; the first snapshot
    /// yields an all-zero rate vector.
    pub fn snapshot(&mut self, interval: Duration) {
        let cur = match &self.cur {
            Some(cur) => cur.clone(),
            None => return,
        };
        match &self.last {
            Some(last) => {
                let secs = interval.as_secs_f64();
                self.delta = Some(
                    cur.iter()
                        .zip(last.iter())
                        .map(|(c, l)| (c.wrapping_sub(*l) & self.mask) as f64 / secs)
                        .collect(),
                );
            }
            None => self.delta = Some(vec![0.0; cur.len()]),
        }
        self.last = Some(cur);
    }

    /// The most recent per-second rates, if two snapshots have been taken.
    pub fn delta(&self) -> Option<Vec<f64>> {
        self.delta.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraparound_delta() {
        let mut t = DeltaTracker::new(0xFFFF);
        t.update(vec![0xFFF0, 10]);
        t.snapshot(Duration::from_secs(1));
        assert_eq!(t.delta(), Some(vec![0.0, 0.0]));

        t.update(vec![0x0010, 30]);
        t.snapshot(Duration::from_secs(2));
        // 0xFFF0 -> 0x0010 wraps to 32 counts over 2 seconds.
        assert_eq!(t.delta(), Some(vec![16.0, 10.0]));
    }

    #[test]
    fn no_sample_no_delta() {
        let mut t = DeltaTracker::new(0xFFFF_FFFF);
        t.snapshot(Duration::from_secs(1));
        assert_eq!(t.delta(), None);
    }
}
