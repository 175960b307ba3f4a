//! Dev workflow detector: build, test and version-control milestones.
//!
//! Commands are classified by a regex table over their canonical form (env
//! assignments and wrappers removed). Tool summary lines in `OUTPUT`
//! records are quick-rejected with an Aho-Corasick anchor scan before any
//! regex runs, since nearly all output lines are not summaries.
//!
//! While a classified command is pending, an output summary reuses the
//! command as its payload key, so the summary and the later `CMD_END`
//! collapse in the reducer.

use std::fmt;
use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::trace;

use super::command::{canonical_command, parse_command_payload};
use super::session::{SessionPhase, SessionTable};
use super::{Detector, candidate};
use crate::config::DevWorkflowConfig;
use crate::detection::{DetectionEvent, DetectorId, normalize_payload_key};
use crate::error::DetectorFault;
use crate::parser::{Category, ParsedRecord};

/// `CMD_END` of a classified command with a live start.
pub const PAIRED_CONFIDENCE: f64 = 0.9;
/// `CMD_END` classified from its payload alone.
pub const PAYLOAD_CONFIDENCE: f64 = 0.7;
/// Tool summary line in command output.
pub const OUTPUT_CONFIDENCE: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    Build,
    Test,
    Vcs,
}

impl Milestone {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Vcs => "vcs",
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Command classification
// =============================================================================

static TEST_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)^(?:
            cargo\s+(?:test|nextest)
          | (?:npm|pnpm|yarn|bun)\s+(?:run\s+)?test
          | go\s+test
          | swift\s+test
          | xcodebuild\b.*\btest
          | pytest | py\.test | python3?\s+-m\s+pytest
          | (?:npx\s+)?(?:jest|vitest)
          | mvn\s+(?:\S+\s+)*?(?:test|verify)
          | (?:\./)?gradlew?\s+(?:\S+\s+)*?test
          | make\s+(?:test|check)
        )\b",
    )
    .expect("valid test command regex")
});

static BUILD_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)^(?:
            cargo\s+(?:build|check|clippy|run)
          | (?:npm|pnpm|yarn|bun)\s+(?:run\s+)?build
          | go\s+build
          | swift\s+build
          | xcodebuild
          | make
          | mvn\s+(?:\S+\s+)*?(?:compile|package|install)
          | (?:\./)?gradlew?\s+(?:\S+\s+)*?(?:build|assemble)
        )\b",
    )
    .expect("valid build command regex")
});

static VCS_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?xi)^(?:
            git\s+(?:commit|push|pull|merge|rebase|fetch|clone|checkout|switch|tag|cherry-pick)
          | gh\s+pr\s+(?:create|merge|checkout)
        )\b",
    )
    .expect("valid vcs command regex")
});

/// Ordered: `xcodebuild test` must classify as a test before the build
/// pattern sees it.
static COMMAND_TABLE: [(Milestone, &LazyLock<Regex>); 3] = [
    (Milestone::Test, &TEST_COMMAND),
    (Milestone::Build, &BUILD_COMMAND),
    (Milestone::Vcs, &VCS_COMMAND),
];

/// Classify a command line, if it is a dev milestone.
#[must_use]
pub fn classify_command(command: &str) -> Option<Milestone> {
    let canonical = canonical_command(command);
    COMMAND_TABLE
        .iter()
        .find(|(_, re)| re.is_match(&canonical))
        .map(|(milestone, _)| *milestone)
}

// =============================================================================
// Output summaries
// =============================================================================

static SUMMARY_ANCHORS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build([
            "test result:",
            " passed",
            " failed",
            "** build ",
            "** test ",
            "** archive ",
            "finished",
            "could not compile",
            "tests:",
        ])
        .expect("valid Aho-Corasick patterns")
});

static CARGO_TEST_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test result: (ok|FAILED)\. \d+ passed; \d+ failed").expect("valid regex")
});
static PYTEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^=+ .*\b\d+ (?:passed|failed)\b.* in [\d.]+s\b.*=+$").expect("valid regex")
});
static JEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Tests:\s+.*\b\d+ total$").expect("valid regex"));
static XCODE_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\*\* (BUILD|TEST|ARCHIVE) (SUCCEEDED|FAILED) \*\*$").expect("valid regex")
});
static CARGO_FINISHED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Finished\b.*\btarget\(s\) in [\d.]+m?s$").expect("valid regex")
});
static CARGO_COULD_NOT_COMPILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^error: could not compile `[^`]+`").expect("valid regex"));
static FAILED_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[1-9]\d* (?:failed|errors?)\b").expect("valid regex"));

/// Classify a tool summary line as `(milestone, success)`.
#[must_use]
pub fn classify_output(line: &str) -> Option<(Milestone, bool)> {
    let line = line.trim();
    if !SUMMARY_ANCHORS.is_match(line) {
        return None;
    }
    if let Some(caps) = CARGO_TEST_RESULT.captures(line) {
        return Some((Milestone::Test, &caps[1] == "ok"));
    }
    if let Some(caps) = XCODE_SUMMARY.captures(line) {
        let milestone = if &caps[1] == "TEST" {
            Milestone::Test
        } else {
            Milestone::Build
        };
        return Some((milestone, &caps[2] == "SUCCEEDED"));
    }
    if PYTEST_SUMMARY.is_match(line) || JEST_SUMMARY.is_match(line) {
        return Some((Milestone::Test, !FAILED_COUNT.is_match(line)));
    }
    if CARGO_FINISHED.is_match(line) {
        return Some((Milestone::Build, true));
    }
    if CARGO_COULD_NOT_COMPILE.is_match(line) {
        return Some((Milestone::Build, false));
    }
    None
}

// =============================================================================
// Detector
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevPending {
    pub command: String,
    pub milestone: Milestone,
    pub started_ms: u64,
}

pub struct DevWorkflowDetector {
    sessions: SessionTable<SessionPhase<DevPending>>,
    max_pending_ms: u64,
}

impl DevWorkflowDetector {
    #[must_use]
    pub fn new(config: &DevWorkflowConfig, max_sessions: usize) -> Self {
        Self {
            sessions: SessionTable::new(max_sessions),
            max_pending_ms: config.max_pending_ms,
        }
    }

    #[must_use]
    pub fn phase(&self, session_id: &str) -> Option<&SessionPhase<DevPending>> {
        self.sessions.get(session_id)
    }

    fn live_pending(&self, session_id: &str, now: u64) -> Option<DevPending> {
        match self.sessions.get(session_id) {
            Some(SessionPhase::Pending(pending))
                if now.saturating_sub(pending.started_ms) <= self.max_pending_ms =>
            {
                Some(pending.clone())
            }
            _ => None,
        }
    }

    fn on_start(&mut self, record: &ParsedRecord) {
        let now = record.event_time_ms();
        let command = parse_command_payload(&record.payload).command;
        match classify_command(&command) {
            Some(milestone) => self.sessions.insert(
                &record.session_id,
                SessionPhase::Pending(DevPending {
                    command,
                    milestone,
                    started_ms: now,
                }),
                now,
            ),
            None => {
                self.sessions.remove(&record.session_id);
            }
        }
    }

    fn on_end(&mut self, record: &ParsedRecord) -> Vec<DetectionEvent> {
        let now = record.event_time_ms();
        let outcome = parse_command_payload(&record.payload);
        let pending = self.live_pending(&record.session_id, now);

        let command = if outcome.command.is_empty() {
            match (&pending, self.sessions.get(&record.session_id)) {
                (Some(p), _) => p.command.clone(),
                (None, Some(SessionPhase::Emitted { key, .. })) => key.clone(),
                _ => String::new(),
            }
        } else {
            outcome.command
        };
        let Some(milestone) = classify_command(&command).or(pending.as_ref().map(|p| p.milestone))
        else {
            self.sessions.remove(&record.session_id);
            return Vec::new();
        };

        let confidence = if pending.is_some() {
            PAIRED_CONFIDENCE
        } else {
            PAYLOAD_CONFIDENCE
        };
        let success = outcome.exit_code.map(|code| code == 0);
        let duration_ms = outcome
            .duration_ms
            .or_else(|| pending.as_ref().map(|p| now.saturating_sub(p.started_ms)));
        self.sessions.insert(
            &record.session_id,
            SessionPhase::Emitted {
                at_ms: now,
                key: normalize_payload_key(&command),
            },
            now,
        );

        let summary = match success {
            Some(true) => format!("{milestone} succeeded: `{command}`"),
            Some(false) => format!("{milestone} failed: `{command}`"),
            None => format!("{milestone} finished: `{command}`"),
        };
        vec![candidate(
            DetectorId::DevWorkflow,
            record,
            &command,
            confidence,
            summary,
            json!({
                "milestone": milestone,
                "command": command,
                "success": success,
                "exit_code": outcome.exit_code,
                "duration_ms": duration_ms,
            }),
        )]
    }

    fn on_output(&mut self, record: &ParsedRecord) -> Vec<DetectionEvent> {
        let Some((milestone, success)) = classify_output(&record.payload) else {
            return Vec::new();
        };
        let now = record.event_time_ms();
        let line = record.payload.trim();
        let pending = self.live_pending(&record.session_id, now);
        let key = match (&pending, self.sessions.get(&record.session_id)) {
            (Some(p), _) => p.command.clone(),
            (None, Some(SessionPhase::Emitted { at_ms, key }))
                if now.saturating_sub(*at_ms) <= self.max_pending_ms =>
            {
                key.clone()
            }
            _ => line.to_string(),
        };
        trace!(session_id = %record.session_id, %milestone, success, "dev summary line");

        let verdict = if success { "succeeded" } else { "failed" };
        vec![candidate(
            DetectorId::DevWorkflow,
            record,
            &key,
            OUTPUT_CONFIDENCE,
            format!("{milestone} {verdict}"),
            json!({
                "milestone": milestone,
                "command": pending.map(|p| p.command),
                "success": success,
                "summary_line": line,
            }),
        )]
    }
}

impl Detector for DevWorkflowDetector {
    fn id(&self) -> DetectorId {
        DetectorId::DevWorkflow
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
