//! Detection values shared by detectors, the reducer and the event bus.
//!
//! A [`DetectionEvent`] is a candidate produced by one detector; the reducer
//! turns candidates into [`ConfirmedDetection`]s. Fingerprints depend only on
//! record content, so replaying the same lines yields the same fingerprints.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::parser::RecordTime;

/// What kind of activity a detection reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionKind {
    AiResponse,
    TaskCompletion,
    DevWorkflow,
}

impl DetectionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AiResponse => "ai-response",
            Self::TaskCompletion => "task-completion",
            Self::DevWorkflow => "dev-workflow",
        }
    }

    /// Fingerprint basis. A finished command may be reported both as a task
    /// completion and as a dev-workflow milestone; both share one basis so
    /// the reducer collapses them.
    #[must_use]
    pub const fn fingerprint_class(self) -> &'static str {
        match self {
            Self::AiResponse => "ai-response",
            Self::TaskCompletion | Self::DevWorkflow => "command",
        }
    }
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of the detector that produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorId {
    AiResponse,
    TaskCompletion,
    DevWorkflow,
}

impl DetectorId {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AiResponse => "ai_response",
            Self::TaskCompletion => "task_completion",
            Self::DevWorkflow => "dev_workflow",
        }
    }

    /// The kind of detection this detector produces.
    #[must_use]
    pub const fn kind(self) -> DetectionKind {
        match self {
            Self::AiResponse => DetectionKind::AiResponse,
            Self::TaskCompletion => DetectionKind::TaskCompletion,
            Self::DevWorkflow => DetectionKind::DevWorkflow,
        }
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable content hash identifying "the same" detection.
///
/// Hex of the first 16 bytes of SHA-256 over the kind's fingerprint class,
/// the session id and the normalized payload key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn compute(kind: DetectionKind, session_id: &str, payload_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.fingerprint_class().as_bytes());
        hasher.update([0u8]);
        hasher.update(session_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_payload_key(payload_key).as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lowercase and collapse whitespace so cosmetic differences in a retried
/// hook line do not defeat deduplication.
#[must_use]
pub fn normalize_payload_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for word in key.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(word.chars().flat_map(char::to_lowercase));
    }
    out
}

/// A candidate detection emitted by one detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub kind: DetectionKind,
    pub session_id: String,
    pub fingerprint: Fingerprint,
    /// Confidence score 0.0-1.0
    pub confidence: f64,
    pub source_timestamp: RecordTime,
    /// Time base for windowing: source time when parseable, else ingestion time.
    pub event_time_ms: u64,
    pub detector: DetectorId,
    /// Short human-readable description
    pub summary: String,
    /// Detector-specific structured data
    pub extracted: serde_json::Value,
}

/// A detection that survived deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedDetection {
    #[serde(flatten)]
    pub detection: DetectionEvent,
    /// Every detector that produced this fingerprint inside the window
    pub detectors: BTreeSet<DetectorId>,
    pub confirmed_at_ms: u64,
}

impl ConfirmedDetection {
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.detection.fingerprint
    }

    #[must_use]
    pub fn kind(&self) -> DetectionKind {
        self.detection.kind
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.detection.session_id
    }
}
