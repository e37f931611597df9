//! Sequence-gap detection and the sticky per-series gap flags.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use candle_sync_core::SeriesId;

/// Classification of one sequence number against the previous one on the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceObservation {
    /// First observation since reset, or exactly `last + 1`.
    Contiguous,
    /// `n` messages were skipped.
    Gap(u64),
    /// `seq <= last`: late duplicate, not an error.
    Duplicate,
}

/// Tracks the last sequence number seen on the current physical connection.
///
/// Numbering restarts with every connection, so the owner must call [`reset`] each
/// time a new connection comes up.
///
/// [`reset`]: SequenceGapDetector::reset
#[derive(Debug, Clone, Default)]
pub struct SequenceGapDetector {
    last: Option<u64>,
}

impl SequenceGapDetector {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    pub fn observe(&mut self, sequence: u64) -> SequenceObservation {
        let Some(last) = self.last else {
            self.last = Some(sequence);
            return SequenceObservation::Contiguous;
        };
        if sequence <= last {
            return SequenceObservation::Duplicate;
        }
        self.last = Some(sequence);
        match sequence - last - 1 {
            0 => SequenceObservation::Contiguous,
            missed => SequenceObservation::Gap(missed),
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Last accepted sequence number, `0` right after a reset.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FlagState {
    raised: u64,
    cleared: u64,
    /// Earliest known-good timestamp before the hole, when the raiser knew one.
    since: Option<DateTime<Utc>>,
}

/// Sticky "a gap was seen" flags, one per series.
///
/// Flags are generation counted: a reconciliation pass records the generation it
/// started from and clears only up to that, so a gap raised while the pass is
/// running stays set.
#[derive(Debug, Default)]
pub struct GapFlags {
    flags: Mutex<HashMap<SeriesId, FlagState>>,
}

impl GapFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, series: &SeriesId) {
        let mut flags = self.flags.lock();
        flags.entry(series.clone()).or_default().raised += 1;
    }

    /// Raises the flag and records that nothing is missing before `since`.
    ///
    /// Hints accumulate to the earliest one until the flag is fully cleared.
    pub fn raise_since(&self, series: &SeriesId, since: DateTime<Utc>) {
        let mut flags = self.flags.lock();
        let flag = flags.entry(series.clone()).or_default();
        flag.raised += 1;
        flag.since = Some(flag.since.map_or(since, |s| s.min(since)));
    }

    /// Where a backfill for the raised flag should start, if any raiser knew.
    #[must_use]
    pub fn since(&self, series: &SeriesId) -> Option<DateTime<Utc>> {
        self.flags
            .lock()
            .get(series)
            .filter(|f| f.raised > f.cleared)
            .and_then(|f| f.since)
    }

    #[must_use]
    pub fn is_raised(&self, series: &SeriesId) -> bool {
        self.flags
            .lock()
            .get(series)
            .is_some_and(|f| f.raised > f.cleared)
    }

    /// Current generation, to be passed back to [`GapFlags::clear_through`].
    #[must_use]
    pub fn generation(&self, series: &SeriesId) -> u64 {
        self.flags.lock().get(series).map_or(0, |f| f.raised)
    }

    pub fn clear_through(&self, series: &SeriesId, generation: u64) {
        if let Some(flag) = self.flags.lock().get_mut(series) {
            flag.cleared = flag.cleared.max(generation.min(flag.raised));
            if flag.cleared == flag.raised {
                flag.since = None;
            }
        }
    }
}
