//! Property-based tests for the tailer.
//!
//! Covers arbitrary append interleavings, bounded reads, restarts from a
//! saved watermark and rename rotation.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use proptest::prelude::*;

use onibi_core::config::StartPosition;
use onibi_core::stats::PipelineStats;
use onibi_core::tailer::{LogLine, TailBuffer, TailerConfig};

// =============================================================================
// Helpers
// =============================================================================

fn append(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
}

fn config(max_read_bytes: usize) -> TailerConfig {
    TailerConfig {
        max_read_bytes,
        start_position: StartPosition::Beginning,
        ..TailerConfig::default()
    }
}

fn open(path: &Path, max_read_bytes: usize) -> TailBuffer {
    TailBuffer::open(path, config(max_read_bytes), None, Arc::new(PipelineStats::new())).unwrap()
}

/// Poll until the read offset stops moving.
fn drain(tailer: &mut TailBuffer) -> Vec<LogLine> {
    let mut out = Vec::new();
    loop {
        let before = tailer.read_offset();
        let poll = tailer.poll().unwrap();
        let idle = poll.lines.is_empty() && tailer.read_offset() == before;
        out.extend(poll.lines);
        if idle {
            return out;
        }
    }
}

/// Complete lines of `content` and the offset just past the last terminator.
fn complete_lines(content: &str) -> (Vec<String>, u64) {
    let Some(last) = content.rfind('\n') else {
        return (Vec::new(), 0);
    };
    let lines = content[..last].split('\n').map(str::to_string).collect();
    (lines, last as u64 + 1)
}

// =============================================================================
// Strategies
// =============================================================================

fn arb_line() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 |_:.-]{0,40}"
}

fn arb_content() -> impl Strategy<Value = String> {
    (prop::collection::vec(arb_line(), 0..30), any::<bool>()).prop_map(|(lines, partial)| {
        let mut text = String::new();
        for line in &lines {
            text.push_str(line);
            text.push('\n');
        }
        if partial {
            text.push_str("unterminated tail");
        }
        text
    })
}

fn arb_cuts() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..48, 1..24)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn delivered_lines_equal_complete_lines(
        content in arb_content(),
        cuts in arb_cuts(),
        max_read in 1usize..128,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.log");
        append(&path, b"");
        let mut tailer = open(&path, max_read);

        let bytes = content.as_bytes();
        let mut delivered = Vec::new();
        let mut written = 0;
        let mut cut = cuts.iter().cycle();
        while written < bytes.len() {
            let step = (*cut.next().unwrap()).min(bytes.len() - written);
            append(&path, &bytes[written..written + step]);
            written += step;
            delivered.extend(tailer.poll().unwrap().lines);
        }
        delivered.extend(drain(&mut tailer));

        let (expected, watermark) = complete_lines(&content);
        let texts: Vec<String> = delivered.iter().map(|l| l.text.clone()).collect();
        prop_assert_eq!(texts, expected);
        prop_assert_eq!(tailer.watermark().offset, watermark);
        prop_assert_eq!(tailer.read_offset(), bytes.len() as u64);

        let mut cursor = 0;
        for line in &delivered {
            prop_assert_eq!(line.start, cursor);
            prop_assert!(line.end > line.start);
            cursor = line.end;
        }
    }

    #[test]
    fn restart_from_watermark_delivers_the_rest_once(
        content in arb_content(),
        split in 0usize..64,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.log");
        let bytes = content.as_bytes();
        let split = split.min(bytes.len());
        append(&path, &bytes[..split]);

        let stats = Arc::new(PipelineStats::new());
        let mut first = TailBuffer::open(&path, config(4096), None, Arc::clone(&stats)).unwrap();
        let mut delivered = drain(&mut first);
        first.abandon_partial();
        let saved = first.watermark();
        drop(first);

        append(&path, &bytes[split..]);
        let mut second = TailBuffer::open(&path, config(4096), Some(saved), stats).unwrap();
        delivered.extend(drain(&mut second));

        let (expected, _) = complete_lines(&content);
        let texts: Vec<String> = delivered.into_iter().map(|l| l.text).collect();
        prop_assert_eq!(texts, expected);
    }

    #[test]
    fn rotation_never_duplicates(
        before in prop::collection::vec("[a-z]{1,12}", 0..10),
        after in prop::collection::vec("[A-Z]{1,12}", 0..10),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.log");
        append(&path, b"");
        let mut tailer = open(&path, 4096);

        let mut delivered = Vec::new();
        for line in &before {
            append(&path, format!("{line}\n").as_bytes());
        }
        delivered.extend(drain(&mut tailer));

        std::fs::rename(&path, dir.path().join("terminal.log.1")).unwrap();
        for line in &after {
            append(&path, format!("{line}\n").as_bytes());
        }
        delivered.extend(drain(&mut tailer));

        let texts: Vec<String> = delivered.into_iter().map(|l| l.text).collect();
        let expected: Vec<String> = before.iter().chain(after.iter()).cloned().collect();
        prop_assert_eq!(texts, expected);
    }
}
