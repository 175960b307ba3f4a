//! The synchronous per-tick chain.
//!
//! ```text
//! TailBuffer.poll ──► LineParser ──► Detectors ──► Reducer ──► EventBus
//! ```
//!
//! One tick processes every line delivered by a single poll, in file order.
//! A detector that errors or panics on a record loses only that session's
//! state; the other detectors still see the record.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detection::{ConfirmedDetection, DetectionEvent};
use crate::detectors::{Detector, build_detectors};
use crate::error::{DetectorFault, Result};
use crate::events::{BusEvent, EventBus, LifecycleEvent};
use crate::parser::{LineParser, ParsedRecord};
use crate::reducer::{ReduceOutcome, Reducer};
use crate::stats::{Counter, PipelineStats};
use crate::tailer::{LogLine, TailBuffer};

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub lines: usize,
    pub records: usize,
    pub candidates: usize,
    pub confirmed: Vec<ConfirmedDetection>,
    pub suppressed: usize,
    pub faults: usize,
    pub expired_sessions: usize,
    pub rotated: bool,
    pub missing: bool,
}

impl TickReport {
    /// Fold a later tick into this one.
    pub fn absorb(&mut self, later: Self) {
        self.lines += later.lines;
        self.records += later.records;
        self.candidates += later.candidates;
        self.confirmed.extend(later.confirmed);
        self.suppressed += later.suppressed;
        self.faults += later.faults;
        self.expired_sessions += later.expired_sessions;
        self.rotated |= later.rotated;
        self.missing = later.missing;
    }
}

pub struct Pipeline {
    tailer: TailBuffer,
    parser: LineParser,
    detectors: Vec<Box<dyn Detector>>,
    reducer: Reducer,
    bus: EventBus,
    stats: Arc<PipelineStats>,
    /// Largest event time seen; detector timeouts run on this clock
    event_clock_ms: u64,
}

impl Pipeline {
    /// Wire a pipeline from configuration around an opened tailer.
    #[must_use]
    pub fn new(tailer: TailBuffer, config: &Config, bus: EventBus, stats: Arc<PipelineStats>) -> Self {
        Self::from_parts(
            tailer,
            build_detectors(&config.detectors),
            Reducer::new(&config.reducer),
            bus,
            stats,
        )
    }

    #[must_use]
    pub fn from_parts(
        tailer: TailBuffer,
        detectors: Vec<Box<dyn Detector>>,
        reducer: Reducer,
        bus: EventBus,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            tailer,
            parser: LineParser::new(Arc::clone(&stats)),
            detectors,
            reducer,
            bus,
            stats,
            event_clock_ms: 0,
        }
    }

    #[must_use]
    pub fn tailer(&self) -> &TailBuffer {
        &self.tailer
    }

    pub fn tailer_mut(&mut self) -> &mut TailBuffer {
        &mut self.tailer
    }

    #[must_use]
    pub fn reducer(&self) -> &Reducer {
        &self.reducer
    }

    pub fn reducer_mut(&mut self) -> &mut Reducer {
        &mut self.reducer
    }

    #[must_use]
    pub fn parser(&self) -> &LineParser {
        &self.parser
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    #[must_use]
    pub fn event_clock_ms(&self) -> u64 {
        self.event_clock_ms
    }

    /// Sessions currently tracked, summed over detectors.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.detectors.iter().map(|d| d.session_count()).sum()
    }

    pub fn tick(&mut self) -> Result<TickReport> {
        self.tick_at(now_ms())
    }

    /// Run one poll through every stage. `now_ms` stamps records whose
    /// timestamp carries no epoch.
    ///
    /// # Errors
    ///
    /// Only I/O errors from the tailer; nothing downstream of it fails.
    pub fn tick_at(&mut self, now_ms: u64) -> Result<TickReport> {
        self.stats.incr(Counter::Ticks);
        let poll = self.tailer.poll()?;

        let mut report = TickReport {
            lines: poll.lines.len(),
            rotated: poll.rotated,
            missing: poll.missing,
            ..TickReport::default()
        };

        if poll.rotated {
            self.bus.publish(BusEvent::Lifecycle(LifecycleEvent::Rotated {
                path: self.tailer.path().to_path_buf(),
            }));
        }

        for line in &poll.lines {
            self.process_line(line, now_ms, &mut report);
        }

        report.expired_sessions = self
            .detectors
            .iter_mut()
            .map(|d| d.expire(self.event_clock_ms))
            .sum();

        if report.lines > 0 {
            debug!(
                path = %self.tailer.path().display(),
                offset = self.tailer.watermark().offset,
                lines = report.lines,
                confirmed = report.confirmed.len(),
                "Tick processed lines"
            );
        }
        Ok(report)
    }

    /// Tick until the tailer stops making progress.
    pub fn drain_at(&mut self, now_ms: u64) -> Result<TickReport> {
        let mut total = TickReport::default();
        loop {
            let before = self.tailer.read_offset();
            let report = self.tick_at(now_ms)?;
            let done = report.lines == 0 && self.tailer.read_offset() == before;
            total.absorb(report);
            if done {
                return Ok(total);
            }
        }
    }

    fn process_line(&mut self, line: &LogLine, now_ms: u64, report: &mut TickReport) {
        let Some(record) = self.parser.parse(line, now_ms) else {
            return;
        };
        report.records += 1;
        self.event_clock_ms = self.event_clock_ms.max(record.event_time_ms());

        // Every candidate of the record is reduced before anything is
        // published, so a confirmation carries all detectors that agreed.
        let mut confirmed_here = Vec::new();
        for candidate in self.run_detectors(&record, report) {
            report.candidates += 1;
            self.stats.incr(Counter::Candidates);
            match self.reducer.reduce_verbose(candidate) {
                ReduceOutcome::Confirmed(confirmed) => {
                    self.stats.incr(Counter::Confirmed);
                    confirmed_here.push(confirmed);
                }
                ReduceOutcome::Suppressed { fingerprint, .. } => {
                    self.stats.incr(Counter::Suppressed);
                    report.suppressed += 1;
                    debug!(fingerprint = %fingerprint, "Duplicate detection suppressed");
                }
                ReduceOutcome::BelowThreshold {
                    fingerprint,
                    confidence,
                } => {
                    self.stats.incr(Counter::BelowThreshold);
                    debug!(fingerprint = %fingerprint, confidence, "Candidate below confidence floor");
                }
            }
        }

        for mut confirmed in confirmed_here {
            if let Some(agreeing) = self.reducer.agreement(confirmed.fingerprint()) {
                confirmed.detectors.clone_from(agreeing);
            }
            info!(
                kind = %confirmed.kind(),
                session_id = %confirmed.session_id(),
                fingerprint = %confirmed.fingerprint(),
                detectors = confirmed.detectors.len(),
                "Detection confirmed"
            );
            self.bus.publish(BusEvent::Detection(confirmed.clone()));
            report.confirmed.push(confirmed);
        }
    }

    fn run_detectors(&mut self, record: &ParsedRecord, report: &mut TickReport) -> Vec<DetectionEvent> {
        let mut candidates = Vec::new();
        for detector in &mut self.detectors {
            let result = panic::catch_unwind(AssertUnwindSafe(|| detector.consume(record)));
            let fault = match result {
                Ok(Ok(found)) => {
                    candidates.extend(found);
                    continue;
                }
                Ok(Err(fault)) => fault,
                Err(payload) => DetectorFault::new(
                    detector.id(),
                    record.session_id.clone(),
                    panic_message(payload.as_ref()),
                ),
            };
            self.stats.incr(Counter::DetectorFaults);
            report.faults += 1;
            warn!(
                detector = %fault.detector,
                session_id = %fault.session_id,
                offset = record.offset,
                reason = %fault.reason,
                "Detector fault; resetting session"
            );
            detector.reset_session(&record.session_id);
        }
        candidates
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}
