//! Pipeline counters.
//!
//! A single [`PipelineStats`] is shared (behind an `Arc`) by the tailer,
//! parser, pipeline and scheduler. Counters are relaxed atomics; a
//! [`PipelineStatsSnapshot`] is a serializable point-in-time copy.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Named counters tracked across the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    BytesRead,
    LinesRead,
    PartialDiscarded,
    OversizedLines,
    Rotations,
    RecordsParsed,
    MalformedLines,
    Candidates,
    Confirmed,
    Suppressed,
    BelowThreshold,
    DetectorFaults,
    IoErrors,
    Truncations,
    BytesReclaimed,
    Ticks,
}

impl Counter {
    const COUNT: usize = 16;

    const fn index(self) -> usize {
        self as usize
    }
}

/// Shared diagnostic sink for the ingestion pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    counters: [AtomicU64; Counter::COUNT],
}

impl PipelineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            bytes_read: self.get(Counter::BytesRead),
            lines_read: self.get(Counter::LinesRead),
            partial_discarded: self.get(Counter::PartialDiscarded),
            oversized_lines: self.get(Counter::OversizedLines),
            rotations: self.get(Counter::Rotations),
            records_parsed: self.get(Counter::RecordsParsed),
            malformed_lines: self.get(Counter::MalformedLines),
            candidates: self.get(Counter::Candidates),
            confirmed: self.get(Counter::Confirmed),
            suppressed: self.get(Counter::Suppressed),
            below_threshold: self.get(Counter::BelowThreshold),
            detector_faults: self.get(Counter::DetectorFaults),
            io_errors: self.get(Counter::IoErrors),
            truncations: self.get(Counter::Truncations),
            bytes_reclaimed: self.get(Counter::BytesReclaimed),
            ticks: self.get(Counter::Ticks),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub bytes_read: u64,
    pub lines_read: u64,
    pub partial_discarded: u64,
    pub oversized_lines: u64,
    pub rotations: u64,
    pub records_parsed: u64,
    pub malformed_lines: u64,
    pub candidates: u64,
    pub confirmed: u64,
    pub suppressed: u64,
    pub below_threshold: u64,
    pub detector_faults: u64,
    pub io_errors: u64,
    pub truncations: u64,
    pub bytes_reclaimed: u64,
    pub ticks: u64,
}
