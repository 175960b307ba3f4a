//! AI response detector: pairs `AI_START` and `AI_END` markers per session.

use serde_json::json;
use tracing::trace;

use super::session::{SessionPhase, SessionTable};
use super::{Detector, candidate};
use crate::config::AiResponseConfig;
use crate::detection::{DetectionEvent, DetectorId, normalize_payload_key};
use crate::error::DetectorFault;
use crate::parser::{Category, ParsedRecord};

/// Confidence of a start/end marker pair, or a repeat of its end marker.
pub const PAIRED_CONFIDENCE: f64 = 0.95;
/// Confidence of an end marker with no known start.
pub const ORPHAN_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiPending {
    pub started_ms: u64,
}

pub struct AiResponseDetector {
    sessions: SessionTable<SessionPhase<AiPending>>,
    max_gap_ms: u64,
}

impl AiResponseDetector {
    #[must_use]
    pub fn new(config: &AiResponseConfig, max_sessions: usize) -> Self {
        Self {
            sessions: SessionTable::new(max_sessions),
            max_gap_ms: config.max_gap_ms,
        }
    }

    #[must_use]
    pub fn phase(&self, session_id: &str) -> Option<&SessionPhase<AiPending>> {
        self.sessions.get(session_id)
    }

    fn on_end(&mut self, record: &ParsedRecord) -> DetectionEvent {
        let now = record.event_time_ms();
        let key = record.payload.trim().to_string();
        let normalized = normalize_payload_key(&key);

        let (confidence, duration_ms) = match self.sessions.get(&record.session_id) {
            Some(SessionPhase::Pending(pending))
                if now.saturating_sub(pending.started_ms) <= self.max_gap_ms =>
            {
                (PAIRED_CONFIDENCE, Some(now.saturating_sub(pending.started_ms)))
            }
            Some(SessionPhase::Emitted { at_ms, key: previous })
                if now.saturating_sub(*at_ms) <= self.max_gap_ms && *previous == normalized =>
            {
                (PAIRED_CONFIDENCE, None)
            }
            _ => (ORPHAN_CONFIDENCE, None),
        };

        trace!(
            session_id = %record.session_id,
            confidence,
            "ai response end"
        );
        self.sessions.insert(
            &record.session_id,
            SessionPhase::Emitted {
                at_ms: now,
                key: normalized,
            },
            now,
        );

        let summary = match duration_ms {
            Some(ms) => format!("AI response finished after {:.1}s", ms as f64 / 1000.0),
            None => "AI response finished".to_string(),
        };
        candidate(
            DetectorId::AiResponse,
            record,
            &key,
            confidence,
            summary,
            json!({
                "response": key,
                "duration_ms": duration_ms,
                "paired": confidence >= PAIRED_CONFIDENCE,
            }),
        )
    }
}

impl Detector for AiResponseDetector {
    fn id(&self) -> DetectorId {
        DetectorId::AiResponse
    }

    fn consume(&mut self, record: &ParsedRecord) -> Result<Vec<DetectionEvent>, DetectorFault> {
        match record.category {
            Category::AiStart => {
                let now = record.event_time_ms();
                self.sessions.insert(
                    &record.session_id,
                    SessionPhase::Pending(AiPending { started_ms: now }),
                    now,
                );
                Ok(Vec::new())
            }
            Category::AiEnd => Ok(vec![self.on_end(record)]),
            _ => Ok(Vec::new()),
        }
    }

    fn expire(&mut self, now_ms: u64) -> usize {
        let gap = self.max_gap_ms;
        self.sessions.expire(now_ms, |_| gap)
    }

    fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn reset_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::test_support::record;

    const T0: u64 = 1_700_000_000_000;

    fn detector() -> AiResponseDetector {
        AiResponseDetector::new(&AiResponseConfig::default(), 64)
    }

    #[test]
    fn start_end_pair_emits_high_confidence() {
        let mut d = detector();
        assert!(d.consume(&record(T0, "S1", "AI_START", "")).unwrap().is_empty());
        assert!(matches!(d.phase("S1"), Some(SessionPhase::Pending(_))));

        let out = d.consume(&record(T0 + 2_000, "S1", "AI_END", "done")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, PAIRED_CONFIDENCE);
        assert_eq!(out[0].extracted["duration_ms"], 2_000);
        assert_eq!(out[0].session_id, "S1");
        assert!(matches!(d.phase("S1"), Some(SessionPhase::Emitted { .. })));
    }

    #[test]
    fn repeated_end_reuses_fingerprint() {
        let mut d = detector();
        d.consume(&record(T0, "S1", "AI_START", "")).unwrap();
        let first = d.consume(&record(T0 + 10, "S1", "AI_END", "done")).unwrap();
        let again = d.consume(&record(T0 + 20, "S1", "AI_END", "done")).unwrap();
        assert_eq!(first[0].fingerprint, again[0].fingerprint);
        assert_eq!(again[0].confidence, PAIRED_CONFIDENCE);
    }

    #[test]
    fn orphan_end_is_low_confidence() {
        let mut d = detector();
        let out = d.consume(&record(T0, "S1", "AI_END", "done")).unwrap();
        assert_eq!(out[0].confidence, ORPHAN_CONFIDENCE);
    }

    #[test]
    fn stale_start_is_abandoned() {
        let mut d = detector();
        let gap = AiResponseConfig::default().max_gap_ms;
        d.consume(&record(T0, "S1", "AI_START", "")).unwrap();
        let out = d.consume(&record(T0 + gap + 1, "S1", "AI_END", "done")).unwrap();
        assert_eq!(out[0].confidence, ORPHAN_CONFIDENCE);
    }

    #[test]
    fn sessions_are_independent() {
        let mut d = detector();
        d.consume(&record(T0, "S1", "AI_START", "")).unwrap();
        let other = d.consume(&record(T0 + 5, "S2", "AI_END", "x")).unwrap();
        assert_eq!(other[0].confidence, ORPHAN_CONFIDENCE);
        let mine = d.consume(&record(T0 + 6, "S1", "AI_END", "x")).unwrap();
        assert_eq!(mine[0].confidence, PAIRED_CONFIDENCE);
        assert_ne!(other[0].fingerprint, mine[0].fingerprint);
    }

    #[test]
    fn command_records_are_ignored() {
        let mut d = detector();
        assert!(d.consume(&record(T0, "S1", "CMD_END", "claude exit=0")).unwrap().is_empty());
        assert_eq!(d.session_count(), 0);
    }

    #[test]
    fn expire_and_reset_clear_state() {
        let mut d = detector();
        let gap = AiResponseConfig::default().max_gap_ms;
        d.consume(&record(T0, "S1", "AI_START", "")).unwrap();
        d.consume(&record(T0, "S2", "AI_START", "")).unwrap();
        d.reset_session("S2");
        assert_eq!(d.session_count(), 1);
        assert_eq!(d.expire(T0 + gap + 1), 1);
        assert_eq!(d.session_count(), 0);
    }
}
