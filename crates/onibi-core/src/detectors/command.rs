//! Command payload helpers shared by the task and dev-workflow detectors.
//!
//! Shell hooks append status tokens to `CMD_END` payloads in a few common
//! shapes: `exit=N`, `exit_code=N`, `status=N`, `exited with code N` and
//! `[exit N]`, optionally with `duration_ms=N`. Whatever is left after the
//! tokens are removed is the command line.

use std::sync::LazyLock;

use regex::Regex;

static EXIT_ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:exit_code|exit|status)=(-?\d+)\b").expect("valid exit regex")
});
static EXITED_WITH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bexited with code (-?\d+)\b").expect("valid exited regex")
});
static EXIT_BRACKET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[exit (-?\d+)\]").expect("valid bracket regex"));
static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bduration_ms=(\d+)\b").expect("valid duration regex"));

static PROCESS_EXITED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\[?process exited with code (-?\d+)\]?$").expect("valid process regex")
});
static PROCESS_COMPLETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\[process completed\]$").expect("valid completed regex")
});

/// Programs that run another command given as their arguments.
const WRAPPERS: &[&str] = &["sudo", "env", "time", "nice", "nohup", "command", "exec"];

/// What a `CMD_END` (or `CMD_START`) payload says about a command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutcome {
    /// Command text with status tokens removed and whitespace collapsed
    pub command: String,
    /// `None` when no known exit-status token is present
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
}

impl CommandOutcome {
    #[must_use]
    pub fn has_status(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Split a payload into command text, exit code and duration.
#[must_use]
pub fn parse_command_payload(payload: &str) -> CommandOutcome {
    let exit_code = [&*EXIT_ASSIGN, &*EXITED_WITH, &*EXIT_BRACKET]
        .iter()
        .find_map(|re| re.captures(payload))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok());
    let duration_ms = DURATION
        .captures(payload)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok());

    let mut rest = payload.to_string();
    for re in [&*EXIT_ASSIGN, &*EXITED_WITH, &*EXIT_BRACKET, &*DURATION] {
        rest = re.replace_all(&rest, " ").into_owned();
    }

    CommandOutcome {
        command: rest.split_whitespace().collect::<Vec<_>>().join(" "),
        exit_code,
        duration_ms,
    }
}

/// Terminal-level "process finished" output lines.
///
/// Returns `Some(Some(code))` for `Process exited with code N`,
/// `Some(None)` for `[Process completed]`, and `None` otherwise.
#[must_use]
pub fn process_exit_line(payload: &str) -> Option<Option<i32>> {
    let line = payload.trim();
    if let Some(caps) = PROCESS_EXITED.captures(line) {
        return Some(caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok()));
    }
    PROCESS_COMPLETED.is_match(line).then_some(None)
}

/// The command with leading env assignments and wrapper programs removed,
/// and the program path reduced to its file name.
///
/// `FOO=1 sudo /usr/bin/cargo test` becomes `cargo test`.
#[must_use]
pub fn canonical_command(command: &str) -> String {
    let mut tokens = command.split_whitespace().peekable();
    let mut in_wrapper = false;
    while let Some(token) = tokens.peek() {
        let is_assignment = token.contains('=') && !token.starts_with('-') && !token.starts_with('=');
        let is_wrapper_flag = in_wrapper && token.starts_with('-');
        if is_assignment || is_wrapper_flag {
            tokens.next();
        } else if WRAPPERS.contains(&basename(token)) {
            in_wrapper = true;
            tokens.next();
        } else {
            break;
        }
    }

    let mut out = String::new();
    if let Some(program) = tokens.next() {
        out.push_str(basename(program));
        for token in tokens {
            out.push(' ');
            out.push_str(token);
        }
    }
    out
}

fn basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}
