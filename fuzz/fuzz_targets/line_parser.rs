#![no_main]

use libfuzzer_sys::fuzz_target;
use onibi_core::config::DetectorsConfig;
use onibi_core::detectors::build_detectors;
use onibi_core::parser::{parse_bytes, parse_line};

const OBSERVED_MS: u64 = 1_700_000_000_000;

fuzz_target!(|data: &[u8]| {
    // Each newline-separated chunk is one candidate line, so a single input
    // can drive a detector through start/end sequences.
    let mut detectors = build_detectors(&DetectorsConfig::default());
    let mut offset = 0u64;
    for chunk in data.split(|&b| b == b'\n') {
        let Ok(record) = parse_bytes(chunk, offset, OBSERVED_MS) else {
            offset += chunk.len() as u64 + 1;
            continue;
        };

        assert!(!record.session_id.is_empty());
        assert!(!record.session_id.chars().any(char::is_whitespace));
        assert_eq!(record.offset, offset);

        // The text form parses the same way.
        let text = String::from_utf8_lossy(chunk);
        assert_eq!(parse_line(&text, offset, OBSERVED_MS).as_ref(), Ok(&record));

        for detector in &mut detectors {
            if let Ok(candidates) = detector.consume(&record) {
                for candidate in candidates {
                    assert!((0.0..=1.0).contains(&candidate.confidence));
                    assert_eq!(candidate.session_id, record.session_id);
                    assert_eq!(candidate.fingerprint.as_str().len(), 32);
                }
            }
        }
        offset += chunk.len() as u64 + 1;
    }
    for detector in &mut detectors {
        let before = detector.session_count();
        let expired = detector.expire(u64::MAX);
        assert_eq!(detector.session_count(), before - expired);
    }
});
