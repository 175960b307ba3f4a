//! Property-based tests for the dedup reducer.
//!
//! The reducer is checked against a last-confirmation model: with
//! non-decreasing event times and an unbounded window table, a candidate is
//! confirmed iff no confirmation with the same fingerprint happened less
//! than `window_ms` earlier.

use std::collections::HashMap;

use proptest::prelude::*;

use onibi_core::config::ReducerConfig;
use onibi_core::detection::{DetectionEvent, DetectorId, Fingerprint};
use onibi_core::parser::RecordTime;
use onibi_core::reducer::{ReduceOutcome, Reducer};

const T0: u64 = 1_700_000_000_000;
const WINDOW_MS: u64 = 5_000;

// =============================================================================
// Helpers
// =============================================================================

#[derive(Debug, Clone)]
struct Step {
    detector: DetectorId,
    session: usize,
    key: usize,
    gap_ms: u64,
    confidence: f64,
}

fn candidate(step: &Step, at_ms: u64) -> DetectionEvent {
    let kind = step.detector.kind();
    let session = format!("S{}", step.session);
    let key = format!("command {}", step.key);
    DetectionEvent {
        kind,
        fingerprint: Fingerprint::compute(kind, &session, &key),
        session_id: session,
        confidence: step.confidence,
        source_timestamp: RecordTime {
            raw: at_ms.to_string(),
            epoch_ms: Some(at_ms),
        },
        event_time_ms: at_ms,
        detector: step.detector,
        summary: key,
        extracted: serde_json::Value::Null,
    }
}

fn reducer(max_entries: usize) -> Reducer {
    Reducer::new(&ReducerConfig {
        window_ms: WINDOW_MS,
        max_entries,
        min_confidence: 0.3,
    })
}

/// Absolute event times for a step sequence starting at `T0`.
fn timeline(steps: &[Step]) -> Vec<u64> {
    let mut at = T0;
    steps
        .iter()
        .map(|step| {
            at += step.gap_ms;
            at
        })
        .collect()
}

// =============================================================================
// Strategies
// =============================================================================

fn arb_detector() -> impl Strategy<Value = DetectorId> {
    prop_oneof![
        Just(DetectorId::AiResponse),
        Just(DetectorId::TaskCompletion),
        Just(DetectorId::DevWorkflow),
    ]
}

fn arb_step() -> impl Strategy<Value = Step> {
    (
        arb_detector(),
        0usize..3,
        0usize..4,
        prop_oneof![Just(0u64), 1u64..2_000, 4_000u64..7_000],
        prop_oneof![4 => 0.5f64..1.0, 1 => 0.0f64..0.3],
    )
        .prop_map(|(detector, session, key, gap_ms, confidence)| Step {
            detector,
            session,
            key,
            gap_ms,
            confidence,
        })
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(arb_step(), 1..60)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn outcomes_match_last_confirmation_model(steps in arb_steps()) {
        let mut r = reducer(4096);
        let mut model: HashMap<Fingerprint, u64> = HashMap::new();

        for (step, at) in steps.iter().zip(timeline(&steps)) {
            let event = candidate(step, at);
            let fingerprint = event.fingerprint.clone();
            let outcome = r.reduce_verbose(event);

            if step.confidence < 0.3 {
                let below = matches!(outcome, ReduceOutcome::BelowThreshold { .. });
                prop_assert!(below);
                continue;
            }
            let live = model.get(&fingerprint).is_some_and(|last| at - last < WINDOW_MS);
            if live {
                let suppressed = matches!(outcome, ReduceOutcome::Suppressed { .. });
                prop_assert!(suppressed);
            } else {
                let confirmed = matches!(outcome, ReduceOutcome::Confirmed(_));
                prop_assert!(confirmed);
                model.insert(fingerprint, at);
            }
        }
    }

    #[test]
    fn confirmations_of_one_fingerprint_are_a_window_apart(steps in arb_steps()) {
        let mut r = reducer(4096);
        let mut last: HashMap<Fingerprint, u64> = HashMap::new();
        for (step, at) in steps.iter().zip(timeline(&steps)) {
            if let Some(confirmed) = r.reduce(candidate(step, at)) {
                if let Some(previous) = last.insert(confirmed.fingerprint().clone(), at) {
                    prop_assert!(at - previous >= WINDOW_MS);
                }
                prop_assert_eq!(confirmed.detectors.len(), 1);
            }
        }
    }

    #[test]
    fn suppressed_detectors_merge_into_agreement(steps in arb_steps()) {
        let mut r = reducer(4096);
        for (step, at) in steps.iter().zip(timeline(&steps)) {
            if let ReduceOutcome::Suppressed { fingerprint, detectors } =
                r.reduce_verbose(candidate(step, at))
            {
                prop_assert!(detectors.contains(&step.detector));
                prop_assert_eq!(r.agreement(&fingerprint), Some(&detectors));
            }
        }
    }

    #[test]
    fn window_table_stays_bounded(steps in arb_steps(), max_entries in 1usize..6) {
        let mut r = reducer(max_entries);
        for (step, at) in steps.iter().zip(timeline(&steps)) {
            r.reduce(candidate(step, at));
            prop_assert!(r.len() <= max_entries);
        }
    }

    #[test]
    fn snapshot_restore_continues_like_an_uninterrupted_run(
        steps in arb_steps(),
        split in 0usize..60,
    ) {
        let times = timeline(&steps);
        let split = split.min(steps.len());

        let mut straight = reducer(4096);
        let straight_out: Vec<bool> = steps
            .iter()
            .zip(&times)
            .map(|(step, at)| straight.reduce(candidate(step, *at)).is_some())
            .collect();

        let mut before = reducer(4096);
        let mut resumed_out: Vec<bool> = steps[..split]
            .iter()
            .zip(&times)
            .map(|(step, at)| before.reduce(candidate(step, *at)).is_some())
            .collect();
        let snapshot = before.snapshot();
        let restart_at = if split == 0 { T0 } else { times[split - 1] };

        let mut after = reducer(4096);
        after.restore(snapshot, restart_at);
        resumed_out.extend(
            steps[split..]
                .iter()
                .zip(&times[split..])
                .map(|(step, at)| after.reduce(candidate(step, *at)).is_some()),
        );

        prop_assert_eq!(straight_out, resumed_out);
    }
}
