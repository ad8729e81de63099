//! Correlation between two independently clocked timestamp streams.
//!
//! A recording session carries two clocks that never tick together: the
//! control loop's sample timestamps and the clock of an externally timestamped
//! artifact such as recorded video. The correlator keeps an append-only table
//! of `(local, external)` pairs observed when an external event was attributed
//! to a local sample, and estimates the external timestamp for any local
//! timestamp by interpolating between the bracketing pairs. It never mutates
//! recorded data; it only builds the auxiliary alignment table used for
//! synchronized playback.

use tracing::warn;

use crate::{Result, StreamError};

/// One observed pairing of the two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampSample {
    /// Control-loop timestamp, nanoseconds, monotonic.
    pub local: i64,
    /// External clock timestamp at the same instant.
    pub external: i64,
}

/// Append-only alignment table between a local and an external clock.
#[derive(Debug, Default, Clone)]
pub struct TimestampCorrelator {
    samples: Vec<TimestampSample>,
}

impl TimestampCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `external` was observed at local time `local`.
    ///
    /// The local clock is assumed monotonic: a sample earlier than the last
    /// recorded one is dropped with a [`StreamError::ClockOrder`]. The error
    /// is non-fatal: log it and keep feeding samples.
    pub fn add_sample(&mut self, local: i64, external: i64) -> Result<()> {
        if let Some(last) = self.samples.last() {
            if local < last.local {
                warn!(local, previous = last.local, "dropping out-of-order timestamp sample");
                return Err(StreamError::ClockOrder { previous: last.local, sample: local });
            }
        }
        self.samples.push(TimestampSample { local, external });
        Ok(())
    }

    /// Number of recorded samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Recorded samples in arrival order.
    pub fn samples(&self) -> &[TimestampSample] {
        &self.samples
    }

    /// Estimate the external timestamp at local time `local`.
    ///
    /// Inside the recorded range the bracketing pair is found by binary search
    /// and interpolated linearly, which tolerates jitter between the two
    /// clocks' sampling rates. Outside the range (or with a single sample) the
    /// nearest neighbor is returned. Returns `None` only when no samples have
    /// been recorded.
    pub fn correlate(&self, local: i64) -> Option<i64> {
        let first = self.samples.first()?;
        let last = self.samples.last()?;
        if local <= first.local {
            return Some(first.external);
        }
        if local >= last.local {
            return Some(last.external);
        }

        // partition_point: index of the first sample with .local > local.
        let upper = self.samples.partition_point(|s| s.local <= local);
        let after = self.samples[upper];
        let before = self.samples[upper - 1];
        if after.local == before.local {
            return Some(before.external);
        }

        // i128 keeps nanosecond-scale products from overflowing.
        let span = (after.local - before.local) as i128;
        let offset = (local - before.local) as i128;
        let delta = (after.external - before.external) as i128;
        Some(before.external + (delta * offset / span) as i64)
    }
}
