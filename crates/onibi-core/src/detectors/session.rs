//! Per-session state arena shared by the detectors.
//!
//! A session with no entry is `Idle`. Entries carry the time they were last
//! touched so they can be evicted on timeout; the table is capped and evicts
//! the least recently touched session when full.

use std::collections::HashMap;

/// Non-idle phase of a session inside one detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase<P> {
    /// A start was seen; waiting for the matching end
    Pending(P),
    /// A detection was emitted; duplicates of the end are still recognised
    Emitted { at_ms: u64, key: String },
}

impl<P> SessionPhase<P> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending(_) => "pending",
            Self::Emitted { .. } => "emitted",
        }
    }
}

#[derive(Debug)]
struct Slot<S> {
    state: S,
    touched_ms: u64,
}

#[derive(Debug)]
pub struct SessionTable<S> {
    entries: HashMap<String, Slot<S>>,
    max_sessions: usize,
    evicted: u64,
}

impl<S> SessionTable<S> {
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_sessions: max_sessions.max(1),
            evicted: 0,
        }
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<&S> {
        self.entries.get(session_id).map(|slot| &slot.state)
    }

    pub fn insert(&mut self, session_id: &str, state: S, now_ms: u64) {
        if !self.entries.contains_key(session_id) && self.entries.len() >= self.max_sessions {
            self.evict_oldest();
        }
        self.entries.insert(
            session_id.to_string(),
            Slot {
                state,
                touched_ms: now_ms,
            },
        );
    }

    pub fn remove(&mut self, session_id: &str) -> Option<S> {
        self.entries.remove(session_id).map(|slot| slot.state)
    }

    /// Drop every entry whose age exceeds `ttl(state)`. Returns how many.
    pub fn expire(&mut self, now_ms: u64, ttl: impl Fn(&S) -> u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| now_ms.saturating_sub(slot.touched_ms) <= ttl(&slot.state));
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sessions dropped because the table was full.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.touched_ms)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.entries.remove(&id);
            self.evicted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_session_is_idle() {
        let table: SessionTable<u32> = SessionTable::new(4);
        assert!(table.get("s").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_touched() {
        let mut table = SessionTable::new(2);
        table.insert("a", 1, 10);
        table.insert("b", 2, 20);
        table.insert("a", 3, 30);
        table.insert("c", 4, 40);
        assert_eq!(table.len(), 2);
        assert!(table.get("b").is_none());
        assert_eq!(table.get("a"), Some(&3));
        assert_eq!(table.evicted(), 1);
    }

    #[test]
    fn expire_uses_per_state_ttl() {
        let mut table = SessionTable::new(8);
        table.insert("short", 100u64, 0);
        table.insert("long", 10_000u64, 0);
        assert_eq!(table.expire(500, |ttl| *ttl), 1);
        assert!(table.get("short").is_none());
        assert!(table.get("long").is_some());
    }

    #[test]
    fn phase_names() {
        let pending: SessionPhase<()> = SessionPhase::Pending(());
        assert_eq!(pending.name(), "pending");
        let emitted: SessionPhase<()> = SessionPhase::Emitted {
            at_ms: 0,
            key: String::new(),
        };
        assert_eq!(emitted.name(), "emitted");
    }
}
