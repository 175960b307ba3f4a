//! Task completion detector: a command finished with a known exit status.

use serde_json::json;
use tracing::trace;

use super::command::{CommandOutcome, parse_command_payload, process_exit_line};
use super::session::{SessionPhase, SessionTable};
use super::{Detector, candidate};
use crate::config::TaskCompletionConfig;
use crate::detection::{DetectionEvent, DetectorId, normalize_payload_key};
use crate::error::DetectorFault;
use crate::parser::{Category, ParsedRecord};

/// `CMD_END` paired with a live `CMD_START`.
pub const PAIRED_CONFIDENCE: f64 = 0.9;
/// `CMD_END` judged from its payload alone.
pub const PAYLOAD_CONFIDENCE: f64 = 0.7;
/// Terminal "process exited" output line.
pub const OUTPUT_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPending {
    pub command: String,
    pub started_ms: u64,
}

pub struct TaskCompletionDetector {
    sessions: SessionTable<SessionPhase<TaskPending>>,
    min_duration_ms: u64,
    max_pending_ms: u64,
}

impl TaskCompletionDetector {
    #[must_use]
    pub fn new(config: &TaskCompletionConfig, max_sessions: usize) -> Self {
        Self {
            sessions: SessionTable::new(max_sessions),
            min_duration_ms: config.min_duration_ms,
            max_pending_ms: config.max_pending_ms,
        }
    }

    #[must_use]
    pub fn phase(&self, session_id: &str) -> Option<&SessionPhase<TaskPending>> {
        self.sessions.get(session_id)
    }

    fn live_pending(&self, session_id: &str, now: u64) -> Option<TaskPending> {
        match self.sessions.get(session_id) {
            Some(SessionPhase::Pending(pending))
                if now.saturating_sub(pending.started_ms) <= self.max_pending_ms =>
            {
                Some(pending.clone())
            }
            _ => None,
        }
    }

    fn emitted_key(&self, session_id: &str) -> Option<String> {
        match self.sessions.get(session_id) {
            Some(SessionPhase::Emitted { key, .. }) => Some(key.clone()),
            _ => None,
        }
    }

    fn on_start(&mut self, record: &ParsedRecord) {
        let now = record.event_time_ms();
        let command = parse_command_payload(&record.payload).command;
        if command.is_empty() {
            return;
        }
        self.sessions.insert(
            &record.session_id,
            SessionPhase::Pending(TaskPending {
                command,
                started_ms: now,
            }),
            now,
        );
    }

    fn on_end(&mut self, record: &ParsedRecord) -> Vec<DetectionEvent> {
        let now = record.event_time_ms();
        let CommandOutcome {
            command,
            exit_code,
            duration_ms,
        } = parse_command_payload(&record.payload);
        let Some(exit_code) = exit_code else {
            trace!(session_id = %record.session_id, "command end without exit status");
            self.sessions.remove(&record.session_id);
            return Vec::new();
        };

        let pending = self.live_pending(&record.session_id, now);
        let command = if !command.is_empty() {
            command
        } else if let Some(pending) = &pending {
            pending.command.clone()
        } else {
            self.emitted_key(&record.session_id).unwrap_or_default()
        };
        let duration_ms =
            duration_ms.or_else(|| pending.as_ref().map(|p| now.saturating_sub(p.started_ms)));

        if duration_ms.is_some_and(|d| d < self.min_duration_ms) {
            self.sessions.remove(&record.session_id);
            return Vec::new();
        }

        let key = if command.is_empty() {
            record.payload.trim().to_string()
        } else {
            command.clone()
        };
        let confidence = if pending.is_some() {
            PAIRED_CONFIDENCE
        } else {
            PAYLOAD_CONFIDENCE
        };
        self.sessions.insert(
            &record.session_id,
            SessionPhase::Emitted {
                at_ms: now,
                key: normalize_payload_key(&key),
            },
            now,
        );

        let label = if command.is_empty() { "command" } else { command.as_str() };
        let summary = if exit_code == 0 {
            format!("`{label}` succeeded")
        } else {
            format!("`{label}` failed with exit code {exit_code}")
        };
        vec![candidate(
            DetectorId::TaskCompletion,
            record,
            &key,
            confidence,
            summary,
            json!({
                "command": command,
                "exit_code": exit_code,
                "success": exit_code == 0,
                "duration_ms": duration_ms,
            }),
        )]
    }

    fn on_output(&mut self, record: &ParsedRecord) -> Vec<DetectionEvent> {
        let Some(exit_code) = process_exit_line(&record.payload) else {
            return Vec::new();
        };
        let now = record.event_time_ms();
        let pending = self.live_pending(&record.session_id, now);
        let key = pending
            .as_ref()
            .map(|p| p.command.clone())
            .or_else(|| self.emitted_key(&record.session_id))
            .unwrap_or_else(|| record.payload.trim().to_string());
        self.sessions.insert(
            &record.session_id,
            SessionPhase::Emitted {
                at_ms: now,
                key: normalize_payload_key(&key),
            },
            now,
        );

        let success = exit_code.is_none_or(|code| code == 0);
        let summary = match exit_code {
            Some(code) => format!("process exited with code {code}"),
            None => "process completed".to_string(),
        };
        vec![candidate(
            DetectorId::TaskCompletion,
            record,
            &key,
            OUTPUT_CONFIDENCE,
            summary,
            json!({
                "command": pending.map(|p| p.command),
                "exit_code": exit_code,
                "success": success,
                "duration_ms": null,
            }),
        )]
    }
}

impl Detector for TaskCompletionDetector {
    fn id(&self) -> DetectorId {
        DetectorId::TaskCompletion
    }

    fn consume(&mut self, record: &ParsedRecord) -> Result<Vec<DetectionEvent>, DetectorFault> {
        Ok(match record.category {
            Category::CmdStart => {
                self.on_start(record);
                Vec::new()
            }
            Category::CmdEnd => self.on_end(record),
            Category::Output => self.on_output(record),
            _ => Vec::new(),
        })
    }

    fn expire(&mut self, now_ms: u64) -> usize {
        let ttl = self.max_pending_ms;
        self.sessions.expire(now_ms, |_| ttl)
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

    fn detector() -> TaskCompletionDetector {
        TaskCompletionDetector::new(&TaskCompletionConfig::default(), 64)
    }

    #[test]
    fn start_then_end_emits_paired_candidate() {
        let mut d = detector();
        d.consume(&record(T0, "S1", "CMD_START", "cargo test")).unwrap();
        let out = d.consume(&record(T0 + 1_500, "S1", "CMD_END", "exit=0")).unwrap();
        assert_eq!(out.len(), 1);
        let event = &out[0];
        assert_eq!(event.confidence, PAIRED_CONFIDENCE);
        assert_eq!(event.extracted["command"], "cargo test");
        assert_eq!(event.extracted["exit_code"], 0);
        assert_eq!(event.extracted["success"], true);
        assert_eq!(event.extracted["duration_ms"], 1_500);
    }

    #[test]
    fn end_alone_uses_payload() {
        let mut d = detector();
        let out = d
            .consume(&record(T0, "S1", "CMD_END", "make build exited with code 2"))
            .unwrap();
        assert_eq!(out[0].confidence, PAYLOAD_CONFIDENCE);
        assert_eq!(out[0].extracted["command"], "make build");
        assert_eq!(out[0].extracted["success"], false);
    }

    #[test]
    fn end_without_status_is_silent_and_resets() {
        let mut d = detector();
        d.consume(&record(T0, "S1", "CMD_START", "vim notes.md")).unwrap();
        assert!(d.consume(&record(T0 + 5, "S1", "CMD_END", "vim notes.md")).unwrap().is_empty());
        assert!(d.phase("S1").is_none());
    }

    #[test]
    fn duplicate_end_shares_fingerprint() {
        let mut d = detector();
        d.consume(&record(T0, "S1", "CMD_START", "ls")).unwrap();
        let first = d.consume(&record(T0 + 1, "S1", "CMD_END", "exit=0")).unwrap();
        let dup = d.consume(&record(T0 + 2, "S1", "CMD_END", "exit=0")).unwrap();
        assert_eq!(first[0].fingerprint, dup[0].fingerprint);
        assert_eq!(dup[0].confidence, PAYLOAD_CONFIDENCE);
    }

    #[test]
    fn short_commands_are_filtered_by_min_duration() {
        let config = TaskCompletionConfig {
            min_duration_ms: 1_000,
            ..TaskCompletionConfig::default()
        };
        let mut d = TaskCompletionDetector::new(&config, 8);
        d.consume(&record(T0, "S1", "CMD_START", "ls")).unwrap();
        assert!(d.consume(&record(T0 + 10, "S1", "CMD_END", "exit=0")).unwrap().is_empty());

        let reported = d
            .consume(&record(T0 + 20, "S1", "CMD_END", "sleep 5 exit=0 duration_ms=5000"))
            .unwrap();
        assert_eq!(reported.len(), 1);
    }

    #[test]
    fn process_exit_output_is_low_confidence() {
        let mut d = detector();
        let out = d
            .consume(&record(T0, "S1", "OUTPUT", "Process exited with code 1"))
            .unwrap();
        assert_eq!(out[0].confidence, OUTPUT_CONFIDENCE);
        assert_eq!(out[0].extracted["exit_code"], 1);
        assert!(d.consume(&record(T0, "S1", "OUTPUT", "compiling foo")).unwrap().is_empty());
    }

    #[test]
    fn stale_pending_start_is_not_paired() {
        let mut d = detector();
        let ttl = TaskCompletionConfig::default().max_pending_ms;
        d.consume(&record(T0, "S1", "CMD_START", "sleep 99999")).unwrap();
        let out = d
            .consume(&record(T0 + ttl + 1, "S1", "CMD_END", "exit=0"))
            .unwrap();
        assert_eq!(out[0].confidence, PAYLOAD_CONFIDENCE);
    }
}
