//! Line grammar for the terminal hook log.
//!
//! Each line is `timestamp|session-id|category|payload`. Only the first three
//! `|` separate fields, so the payload may itself contain `|`.
//!
//! [`parse_line`] is pure and total: every input either yields a
//! [`ParsedRecord`] or a [`RejectReason`]. [`LineParser`] wraps it with the
//! malformed-line accounting the pipeline needs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stats::{Counter, PipelineStats};
use crate::tailer::LogLine;

/// Longest line accepted by the grammar.
pub const MAX_LINE_BYTES: usize = 64 * 1024;
pub const MAX_SESSION_ID_LEN: usize = 128;
pub const MAX_CATEGORY_LEN: usize = 32;
pub const MAX_OPAQUE_TIMESTAMP_LEN: usize = 64;

/// Integer timestamps with at most this many digits are seconds.
const MAX_EPOCH_SECONDS_DIGITS: usize = 11;

// =============================================================================
// Types
// =============================================================================

/// The record's own timestamp, as written by the hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTime {
    pub raw: String,
    /// Milliseconds since the Unix epoch, when `raw` is a recognised format.
    pub epoch_ms: Option<u64>,
}

/// Record category. Unknown categories are kept so other consumers can see
/// them, but the built-in detectors ignore them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Category {
    AiStart,
    AiEnd,
    CmdStart,
    CmdEnd,
    Output,
    Other(String),
}

impl Category {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::AiStart => "AI_START",
            Self::AiEnd => "AI_END",
            Self::CmdStart => "CMD_START",
            Self::CmdEnd => "CMD_END",
            Self::Output => "OUTPUT",
            Self::Other(other) => other,
        }
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        match value.as_str() {
            "AI_START" => Self::AiStart,
            "AI_END" => Self::AiEnd,
            "CMD_START" => Self::CmdStart,
            "CMD_END" => Self::CmdEnd,
            "OUTPUT" => Self::Output,
            _ => Self::Other(value),
        }
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        match value {
            Category::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured record parsed from one [`LogLine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub timestamp: RecordTime,
    pub session_id: String,
    pub category: Category,
    pub payload: String,
    /// Byte offset of the line start in the source file
    pub offset: u64,
    /// Ingestion time of the line
    pub observed_ms: u64,
}

impl ParsedRecord {
    /// Time base used for windowing and detector timeouts.
    #[must_use]
    pub fn event_time_ms(&self) -> u64 {
        self.timestamp.epoch_ms.unwrap_or(self.observed_ms)
    }
}

/// Why a line was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Empty,
    TooLong,
    MissingFields,
    InvalidTimestamp,
    InvalidSession,
    InvalidCategory,
}

impl RejectReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::TooLong => "too_long",
            Self::MissingFields => "missing_fields",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::InvalidSession => "invalid_session",
            Self::InvalidCategory => "invalid_category",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Pure parsing
// =============================================================================

/// Parse one line of text.
pub fn parse_line(text: &str, offset: u64, observed_ms: u64) -> Result<ParsedRecord, RejectReason> {
    if text.len() > MAX_LINE_BYTES {
        return Err(RejectReason::TooLong);
    }
    let text = text.strip_suffix('\r').unwrap_or(text);
    if text.trim().is_empty() {
        return Err(RejectReason::Empty);
    }

    let mut fields = text.splitn(4, '|');
    let (Some(raw_ts), Some(session), Some(category), Some(payload)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(RejectReason::MissingFields);
    };

    let raw_ts = raw_ts.trim();
    let epoch_ms = parse_timestamp(raw_ts)?;
    let session = session.trim();
    validate_session(session)?;
    let category = category.trim();
    validate_category(category)?;

    Ok(ParsedRecord {
        timestamp: RecordTime {
            raw: raw_ts.to_string(),
            epoch_ms,
        },
        session_id: session.to_string(),
        category: Category::from(category.to_string()),
        payload: payload.to_string(),
        offset,
        observed_ms,
    })
}

/// Parse arbitrary bytes, replacing invalid UTF-8.
pub fn parse_bytes(bytes: &[u8], offset: u64, observed_ms: u64) -> Result<ParsedRecord, RejectReason> {
    if bytes.len() > MAX_LINE_BYTES {
        return Err(RejectReason::TooLong);
    }
    parse_line(&String::from_utf8_lossy(bytes), offset, observed_ms)
}

/// Interpret a timestamp field.
///
/// Accepts integer epoch seconds or milliseconds, fractional epoch seconds,
/// RFC 3339, or an opaque token (sequence numbers, `T1`, ...) whose epoch is
/// unknown.
pub fn parse_timestamp(raw: &str) -> Result<Option<u64>, RejectReason> {
    if raw.is_empty() {
        return Err(RejectReason::InvalidTimestamp);
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return epoch_from_integer(raw).map(Some);
    }

    if let Some((secs, frac)) = raw.split_once('.') {
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if all_digits(secs) && all_digits(frac) {
            return epoch_from_fraction(secs, frac).map(Some);
        }
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(u64::try_from(parsed.timestamp_millis()).ok());
    }

    let opaque = raw.len() <= MAX_OPAQUE_TIMESTAMP_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'+' | b'-'));
    if opaque {
        Ok(None)
    } else {
        Err(RejectReason::InvalidTimestamp)
    }
}

fn epoch_from_integer(digits: &str) -> Result<u64, RejectReason> {
    let value: u64 = digits.parse().map_err(|_| RejectReason::InvalidTimestamp)?;
    if digits.len() <= MAX_EPOCH_SECONDS_DIGITS {
        value.checked_mul(1000).ok_or(RejectReason::InvalidTimestamp)
    } else {
        Ok(value)
    }
}

fn epoch_from_fraction(secs: &str, frac: &str) -> Result<u64, RejectReason> {
    if secs.len() > MAX_EPOCH_SECONDS_DIGITS {
        return Err(RejectReason::InvalidTimestamp);
    }
    let whole: u64 = secs.parse().map_err(|_| RejectReason::InvalidTimestamp)?;
    let mut millis = 0u64;
    for (i, b) in frac.bytes().take(3).enumerate() {
        millis += u64::from(b - b'0') * 10u64.pow(2 - i as u32);
    }
    whole
        .checked_mul(1000)
        .and_then(|ms| ms.checked_add(millis))
        .ok_or(RejectReason::InvalidTimestamp)
}

fn validate_session(session: &str) -> Result<(), RejectReason> {
    let valid = !session.is_empty()
        && session.chars().count() <= MAX_SESSION_ID_LEN
        && !session.chars().any(|c| c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(RejectReason::InvalidSession)
    }
}

fn validate_category(category: &str) -> Result<(), RejectReason> {
    let mut bytes = category.bytes();
    let valid = category.len() <= MAX_CATEGORY_LEN
        && bytes.next().is_some_and(|b| b.is_ascii_uppercase())
        && bytes.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(RejectReason::InvalidCategory)
    }
}

// =============================================================================
// Stateful wrapper
// =============================================================================

/// Parses lines and accounts for rejected ones.
pub struct LineParser {
    stats: Arc<PipelineStats>,
    rejections: BTreeMap<RejectReason, u64>,
}

impl LineParser {
    #[must_use]
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self {
            stats,
            rejections: BTreeMap::new(),
        }
    }

    /// Parse a delivered line. Malformed lines are counted and dropped.
    pub fn parse(&mut self, line: &LogLine, observed_ms: u64) -> Option<ParsedRecord> {
        match parse_line(&line.text, line.start, observed_ms) {
            Ok(record) => {
                self.stats.incr(Counter::RecordsParsed);
                Some(record)
            }
            Err(reason) => {
                self.stats.incr(Counter::MalformedLines);
                *self.rejections.entry(reason).or_insert(0) += 1;
                debug!(offset = line.start, reason = %reason, "Dropped malformed line");
                None
            }
        }
    }

    #[must_use]
    pub fn malformed_total(&self) -> u64 {
        self.rejections.values().sum()
    }

    /// Rejection counts by reason.
    #[must_use]
    pub fn rejections(&self) -> &BTreeMap<RejectReason, u64> {
        &self.rejections
    }
}
