//! Fingerprint + time-window deduplication of candidate detections.
//!
//! Candidates arrive from every detector in arrival order. The first
//! candidate for a fingerprint is confirmed; any further candidate with the
//! same fingerprint inside the window is suppressed and its detector id is
//! merged into the confirmation's agreement set.
//!
//! ```text
//! candidate ──► below min_confidence? ──► dropped
//!      │
//!      ▼
//! window entry within W? ──► suppressed (detector id merged)
//!      │ no
//!      ▼
//! confirmed (entry created/refreshed)
//! ```
//!
//! The time base is the candidate's `event_time_ms`, never wall-clock time,
//! so replaying a log deduplicates exactly like live tailing.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::ReducerConfig;
use crate::detection::{ConfirmedDetection, DetectionEvent, DetectorId, Fingerprint};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct WindowEntry {
    confirmed_at_ms: u64,
    detectors: BTreeSet<DetectorId>,
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceOutcome {
    Confirmed(ConfirmedDetection),
    /// Merged into an existing confirmation
    Suppressed {
        fingerprint: Fingerprint,
        detectors: BTreeSet<DetectorId>,
    },
    BelowThreshold {
        fingerprint: Fingerprint,
        confidence: f64,
    },
}

impl ReduceOutcome {
    #[must_use]
    pub fn confirmed(self) -> Option<ConfirmedDetection> {
        match self {
            Self::Confirmed(detection) => Some(detection),
            _ => None,
        }
    }
}

/// One persisted window entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub fingerprint: Fingerprint,
    pub confirmed_at_ms: u64,
    pub detectors: BTreeSet<DetectorId>,
}

/// Serializable copy of the dedup window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DedupSnapshot {
    pub window_ms: u64,
    pub entries: Vec<DedupEntry>,
}

// =============================================================================
// Reducer
// =============================================================================

#[derive(Debug)]
pub struct Reducer {
    window_ms: u64,
    max_entries: usize,
    min_confidence: f64,
    entries: HashMap<Fingerprint, WindowEntry>,
}

impl Reducer {
    #[must_use]
    pub fn new(config: &ReducerConfig) -> Self {
        Self {
            window_ms: config.window_ms,
            max_entries: config.max_entries.max(1),
            min_confidence: config.min_confidence,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the confirmation for `candidate`, or `None` when it was
    /// suppressed or dropped.
    pub fn reduce(&mut self, candidate: DetectionEvent) -> Option<ConfirmedDetection> {
        self.reduce_verbose(candidate).confirmed()
    }

    pub fn reduce_verbose(&mut self, candidate: DetectionEvent) -> ReduceOutcome {
        let now = candidate.event_time_ms;
        self.purge(now);

        if candidate.confidence < self.min_confidence {
            trace!(
                fingerprint = %candidate.fingerprint,
                confidence = candidate.confidence,
                "candidate below confidence floor"
            );
            return ReduceOutcome::BelowThreshold {
                fingerprint: candidate.fingerprint,
                confidence: candidate.confidence,
            };
        }

        if let Some(entry) = self.entries.get_mut(&candidate.fingerprint) {
            if entry.confirmed_at_ms.abs_diff(now) < self.window_ms {
                entry.detectors.insert(candidate.detector);
                debug!(
                    fingerprint = %candidate.fingerprint,
                    detector = %candidate.detector,
                    agreeing = entry.detectors.len(),
                    "duplicate detection suppressed"
                );
                return ReduceOutcome::Suppressed {
                    fingerprint: candidate.fingerprint,
                    detectors: entry.detectors.clone(),
                };
            }
        }

        if !self.entries.contains_key(&candidate.fingerprint) && self.entries.len() >= self.max_entries
        {
            self.evict_oldest();
        }
        let detectors = BTreeSet::from([candidate.detector]);
        self.entries.insert(
            candidate.fingerprint.clone(),
            WindowEntry {
                confirmed_at_ms: now,
                detectors: detectors.clone(),
            },
        );
        debug!(
            fingerprint = %candidate.fingerprint,
            kind = %candidate.kind,
            session_id = %candidate.session_id,
            "detection confirmed"
        );
        ReduceOutcome::Confirmed(ConfirmedDetection {
            detection: candidate,
            detectors,
            confirmed_at_ms: now,
        })
    }

    /// Detectors that agreed on a fingerprint still inside the window.
    #[must_use]
    pub fn agreement(&self, fingerprint: &Fingerprint) -> Option<&BTreeSet<DetectorId>> {
        self.entries.get(fingerprint).map(|entry| &entry.detectors)
    }

    /// Copy of the live window, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> DedupSnapshot {
        let mut entries: Vec<DedupEntry> = self
            .entries
            .iter()
            .map(|(fingerprint, entry)| DedupEntry {
                fingerprint: fingerprint.clone(),
                confirmed_at_ms: entry.confirmed_at_ms,
                detectors: entry.detectors.clone(),
            })
            .collect();
        entries.sort_by(|a, b| {
            a.confirmed_at_ms
                .cmp(&b.confirmed_at_ms)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        DedupSnapshot {
            window_ms: self.window_ms,
            entries,
        }
    }

    /// Load entries from a snapshot, skipping those already outside the
    /// window at `now_ms`. Returns how many were restored.
    pub fn restore(&mut self, snapshot: DedupSnapshot, now_ms: u64) -> usize {
        let mut live: Vec<DedupEntry> = snapshot
            .entries
            .into_iter()
            .filter(|entry| now_ms.saturating_sub(entry.confirmed_at_ms) < self.window_ms)
            .collect();
        live.sort_by_key(|entry| std::cmp::Reverse(entry.confirmed_at_ms));
        live.truncate(self.max_entries);

        let restored = live.len();
        for entry in live {
            self.entries.insert(
                entry.fingerprint,
                WindowEntry {
                    confirmed_at_ms: entry.confirmed_at_ms,
                    detectors: entry.detectors,
                },
            );
        }
        debug!(restored, "dedup window restored");
        restored
    }

    fn purge(&mut self, now_ms: u64) {
        let window = self.window_ms;
        self.entries
            .retain(|_, entry| now_ms.saturating_sub(entry.confirmed_at_ms) < window);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.confirmed_at_ms)
            .map(|(fingerprint, _)| fingerprint.clone());
        if let Some(fingerprint) = oldest {
            self.entries.remove(&fingerprint);
        }
    }
}
