//! onibi-core: log ingestion and event detection for Onibi
//!
//! Shell hooks append one line per event to `~/.config/onibi/terminal.log`.
//! This crate tails that file, parses each line, runs heuristic detectors
//! over the records and fans deduplicated detections out to subscribers.
//!
//! # Architecture
//!
//! ```text
//! Watcher ─► TailBuffer ─► LineParser ─► Detectors ─► Reducer ─► EventBus ─► subscribers
//!    ▲                                                              ▲
//!    └──────────── Scheduler (ticks, backoff, persistence) ─────────┘
//!                         └─► Truncator
//! ```
//!
//! # Modules
//!
//! - `watcher`: filesystem change notifications (`notify`)
//! - `tailer`: append-only reading with rotation detection
//! - `parser`: the `timestamp|session|category|payload` line grammar
//! - `detectors`: AI-response, task-completion and dev-workflow detectors
//! - `reducer`: fingerprint and time-window deduplication
//! - `events`: bounded drop-oldest event bus
//! - `pipeline`: the synchronous per-tick chain
//! - `scheduler`: async supervisor with retry/backoff and persistence
//! - `truncator`: reclaims consumed bytes from the log
//! - `persistence`: watermark and dedup-window state, single-instance lock
//! - `config`, `logging`, `error`, `retry`, `stats`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod detection;
pub mod detectors;
pub mod error;
pub mod events;
pub mod logging;
pub mod parser;
pub mod persistence;
pub mod pipeline;
pub mod reducer;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod tailer;
pub mod truncator;
pub mod watcher;

pub use config::Config;
pub use detection::{ConfirmedDetection, DetectionEvent, DetectionKind, DetectorId, Fingerprint};
pub use error::{Error, Result};
pub use events::{BusEvent, EventBus, LifecycleEvent, RecvError, Subscription, TerminalPresence};
pub use parser::{ParsedRecord, RejectReason, parse_line};
pub use pipeline::{Pipeline, TickReport};
pub use scheduler::{Scheduler, SchedulerState};
pub use tailer::{LogLine, TailBuffer, Watermark};
