//! Detectors turn parsed records into candidate detections.
//!
//! Each detector owns a per-session state machine and sees every record in
//! arrival order. Detectors are independent: they never read each other's
//! state and may emit overlapping candidates, which the reducer collapses.
//!
//! ```text
//! ParsedRecord ──► ai_response ─────┐
//!              ──► dev_workflow ────┼──► DetectionEvent candidates ──► Reducer
//!              ──► task_completion ─┘
//! ```

pub mod ai_response;
pub mod command;
pub mod dev_workflow;
pub mod session;
pub mod task_completion;

pub use ai_response::AiResponseDetector;
pub use dev_workflow::{DevWorkflowDetector, Milestone};
pub use session::{SessionPhase, SessionTable};
pub use task_completion::TaskCompletionDetector;

use crate::config::DetectorsConfig;
use crate::detection::{DetectionEvent, DetectorId, Fingerprint};
use crate::error::DetectorFault;
use crate::parser::ParsedRecord;

/// A per-session state machine over parsed records.
pub trait Detector: Send {
    fn id(&self) -> DetectorId;

    /// Feed one record. Returns zero or more candidates.
    ///
    /// # Errors
    ///
    /// A fault is isolated to the record's session: the pipeline resets that
    /// session and keeps going.
    fn consume(&mut self, record: &ParsedRecord) -> Result<Vec<DetectionEvent>, DetectorFault>;

    /// Drop sessions whose state timed out as of `now_ms`. Returns how many.
    fn expire(&mut self, now_ms: u64) -> usize;

    fn session_count(&self) -> usize;

    /// Forget everything known about one session.
    fn reset_session(&mut self, session_id: &str);
}

/// Build the enabled detectors in pipeline order.
#[must_use]
pub fn build_detectors(config: &DetectorsConfig) -> Vec<Box<dyn Detector>> {
    let mut detectors: Vec<Box<dyn Detector>> = Vec::with_capacity(3);
    if config.ai_response.enabled {
        detectors.push(Box::new(AiResponseDetector::new(
            &config.ai_response,
            config.max_sessions,
        )));
    }
    if config.dev_workflow.enabled {
        detectors.push(Box::new(DevWorkflowDetector::new(
            &config.dev_workflow,
            config.max_sessions,
        )));
    }
    if config.task_completion.enabled {
        detectors.push(Box::new(TaskCompletionDetector::new(
            &config.task_completion,
            config.max_sessions,
        )));
    }
    detectors
}

/// Assemble a candidate for `record`, fingerprinted on `key`.
pub(crate) fn candidate(
    detector: DetectorId,
    record: &ParsedRecord,
    key: &str,
    confidence: f64,
    summary: String,
    extracted: serde_json::Value,
) -> DetectionEvent {
    let kind = detector.kind();
    DetectionEvent {
        kind,
        session_id: record.session_id.clone(),
        fingerprint: Fingerprint::compute(kind, &record.session_id, key),
        confidence,
        source_timestamp: record.timestamp.clone(),
        event_time_ms: record.event_time_ms(),
        detector,
        summary,
        extracted,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::parser::{ParsedRecord, parse_line};

    /// Parse a `ts|session|category|payload` line; `ts` is epoch ms.
    pub fn record(ts_ms: u64, session: &str, category: &str, payload: &str) -> ParsedRecord {
        let line = format!("{ts_ms}|{session}|{category}|{payload}");
        parse_line(&line, 0, ts_ms).expect("test line parses")
    }
}
