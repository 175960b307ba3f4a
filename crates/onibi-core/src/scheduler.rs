//! Async supervisor for the pipeline.
//!
//! The scheduler owns every component's lifecycle. `start()` acquires the
//! log path, restores persisted state and spawns one tick task; the task
//! wakes on the tick interval or a watcher signal, whichever comes first,
//! and runs the [`Pipeline`] synchronously. Between ticks it persists state
//! and lets the [`Truncator`] reclaim consumed bytes.
//!
//! ```text
//!            start()                 stop()
//! Stopped ──────────► Running ──────────────► Stopping ──► Stopped
//!                        │  ▲                 (final drain, persist,
//!        I/O error ──────┘  └── backoff        Lifecycle::Stopped)
//! ```
//!
//! I/O failures never stop the task: ticks back off exponentially until one
//! succeeds. Only failing to acquire the path at startup is fatal.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{BusEvent, EventBus, LifecycleEvent};
use crate::persistence::StateStore;
use crate::pipeline::{Pipeline, now_ms};
use crate::reducer::Reducer;
use crate::retry::{Backoff, RetryPolicy};
use crate::stats::{Counter, PipelineStats};
use crate::tailer::{TailBuffer, TailerConfig, Watermark};
use crate::truncator::{TruncateOutcome, Truncator};
use crate::watcher::{ChangeWaiter, FileWatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
    Stopping,
}

/// Drives the pipeline for one log file.
pub struct Scheduler {
    config: Config,
    bus: EventBus,
    stats: Arc<PipelineStats>,
    state_tx: watch::Sender<SchedulerState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: Config, bus: EventBus) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Stopped);
        Self {
            config,
            bus,
            stats: Arc::new(PipelineStats::new()),
            state_tx,
            shutdown_tx: None,
            task: None,
        }
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    /// Observe lifecycle transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    /// Acquire the log path, restore state and spawn the tick task.
    ///
    /// # Errors
    ///
    /// [`Error::Startup`] when the path cannot be created, read or watched,
    /// [`Error::State`] when another watcher holds the state directory, and
    /// [`Error::Runtime`] when already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != SchedulerState::Stopped {
            return Err(Error::Runtime("scheduler is already running".to_string()));
        }
        let path = self.config.log_path()?;
        let startup = |reason: String| Error::Startup {
            path: path.clone(),
            reason,
        };

        acquire_path(&path, self.config.watch.create_if_missing).map_err(startup)?;
        let watcher =
            FileWatcher::watch(&path, &self.config.watch).map_err(|err| startup(err.to_string()))?;

        let store = if self.config.persistence.enabled {
            Some(StateStore::open(self.config.state_dir()?)?)
        } else {
            None
        };
        let restored = store.as_ref().and_then(|s| s.load_watermark(&path));

        let tailer = TailBuffer::open(
            &path,
            TailerConfig::from(&self.config.watch),
            restored,
            Arc::clone(&self.stats),
        )
        .map_err(|err| startup(err.to_string()))?;

        let mut reducer = Reducer::new(&self.config.reducer);
        if self.config.persistence.persist_dedup_window {
            if let Some(snapshot) = store.as_ref().and_then(StateStore::load_dedup) {
                let kept = reducer.restore(snapshot, now_ms());
                debug!(entries = kept, "Restored dedup window");
            }
        }

        let detectors = crate::detectors::build_detectors(&self.config.detectors);
        let pipeline = Pipeline::from_parts(
            tailer,
            detectors,
            reducer,
            self.bus.clone(),
            Arc::clone(&self.stats),
        );
        let offset = pipeline.tailer().watermark().offset;
        let backend = watcher.backend();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tick_loop = TickLoop {
            path: path.clone(),
            waiter: watcher.waiter(),
            watcher: Some(watcher),
            truncator: Truncator::new(&path, &self.config.truncator),
            backoff: Backoff::new(RetryPolicy::from(&self.config.retry)),
            tick_interval: self.config.watch.tick_interval(),
            persist_dedup: self.config.persistence.persist_dedup_window,
            store,
            saved_watermark: restored,
            dedup_dirty: false,
            missing_reported: false,
            bus: self.bus.clone(),
            stats: Arc::clone(&self.stats),
            pipeline,
        };

        self.state_tx.send_replace(SchedulerState::Running);
        self.bus
            .publish(BusEvent::Lifecycle(LifecycleEvent::Started {
                path: path.clone(),
                offset,
                backend: backend.to_string(),
            }));
        info!(path = %path.display(), offset, backend = %backend, "Watching log file");

        self.task = Some(tokio::spawn(tick_loop.run(shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Drain, persist and stop. Idempotent.
    ///
    /// Returns once the tick task has published `Lifecycle::Stopped`.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        self.state_tx.send_replace(SchedulerState::Stopping);
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        let joined = task.await;
        self.state_tx.send_replace(SchedulerState::Stopped);
        joined.map_err(|err| Error::Runtime(format!("tick task failed: {err}")))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
    }
}

/// Make sure the log file exists and is readable.
fn acquire_path(path: &Path, create: bool) -> std::result::Result<(), String> {
    if !path.exists() {
        if !create {
            return Err("file does not exist and watch.create_if_missing is off".to_string());
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| format!("cannot create {}: {err}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| format!("cannot create file: {err}"))?;
        info!(path = %path.display(), "Created empty log file");
    }
    File::open(path).map_err(|err| format!("cannot read file: {err}"))?;
    Ok(())
}

// =============================================================================
// Tick task
// =============================================================================

struct TickLoop {
    path: PathBuf,
    pipeline: Pipeline,
    /// Dropped when stopping, releasing the OS handle
    watcher: Option<FileWatcher>,
    waiter: ChangeWaiter,
    truncator: Truncator,
    store: Option<StateStore>,
    backoff: Backoff,
    tick_interval: Duration,
    persist_dedup: bool,
    saved_watermark: Option<Watermark>,
    dedup_dirty: bool,
    missing_reported: bool,
    bus: EventBus,
    stats: Arc<PipelineStats>,
}

impl TickLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let waiter = self.waiter.clone();
        let mut retry_at: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                () = wait_for_work(&waiter, &mut interval, retry_at) => {}
            }
            retry_at = self.step().map(|delay| Instant::now() + delay);
        }

        self.finish();
    }

    /// One supervised tick. Returns the backoff delay after a failure.
    fn step(&mut self) -> Option<Duration> {
        let _span = crate::onibi_span!("tick", path = %self.path.display()).entered();
        let deleted = match self.watcher.as_mut() {
            Some(watcher) => {
                let signals = watcher.take();
                debug!(signals = %signals, "Tick");
                if watcher.is_deleted() && self.path.exists() {
                    match watcher.rewatch() {
                        Ok(()) => self.missing_reported = false,
                        Err(err) => warn!(path = %self.path.display(), error = %err, "Rewatch failed"),
                    }
                }
                watcher.is_deleted()
            }
            None => false,
        };

        match self.pipeline.tick_at(now_ms()) {
            Ok(report) => {
                if let Some(attempts) = self.backoff.record_success() {
                    info!(path = %self.path.display(), attempts, "Log reads recovered");
                    self.publish(LifecycleEvent::Recovered {
                        path: self.path.clone(),
                        attempts,
                    });
                }
                self.note_missing(report.missing || deleted);
                self.dedup_dirty |= !report.confirmed.is_empty();
                self.persist();
                self.maybe_truncate();
                None
            }
            Err(err) => {
                self.stats.incr(Counter::IoErrors);
                let delay = self.backoff.record_failure();
                let attempt = self.backoff.failures();
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Tick failed; backing off"
                );
                if attempt == 1 {
                    self.publish(LifecycleEvent::IoDegraded {
                        path: self.path.clone(),
                        error: err.to_string(),
                        attempt,
                        retry_in_ms: delay.as_millis() as u64,
                    });
                }
                Some(delay)
            }
        }
    }

    fn note_missing(&mut self, missing: bool) {
        if missing && !self.missing_reported {
            warn!(path = %self.path.display(), "Log file is missing; waiting for it to reappear");
            self.publish(LifecycleEvent::FileMissing {
                path: self.path.clone(),
            });
            self.missing_reported = true;
        } else if !missing {
            self.missing_reported = false;
        }
    }

    fn persist(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let watermark = self.pipeline.tailer().watermark();
        if self.saved_watermark != Some(watermark) {
            match store.save_watermark(&self.path, watermark, now_ms()) {
                Ok(()) => self.saved_watermark = Some(watermark),
                Err(err) => warn!(error = %err, "Failed to persist watermark"),
            }
        }
        if self.persist_dedup && self.dedup_dirty {
            match store.save_dedup(&self.pipeline.reducer().snapshot()) {
                Ok(()) => self.dedup_dirty = false,
                Err(err) => warn!(error = %err, "Failed to persist dedup window"),
            }
        }
    }

    fn maybe_truncate(&mut self) {
        let watermark = self.pipeline.tailer().watermark();
        let Ok(meta) = fs::metadata(&self.path) else {
            return;
        };
        let now = std::time::Instant::now();
        if !self.truncator.should_run(meta.len(), watermark.offset, now) {
            return;
        }
        match self.truncator.truncate(&watermark, now) {
            Ok(TruncateOutcome::Rotated {
                reclaimed_bytes,
                carried_bytes,
                new_watermark,
            }) => {
                if let Some(identity) = new_watermark.identity {
                    self.pipeline.tailer_mut().adopt_rotation(identity);
                }
                self.stats.incr(Counter::Truncations);
                self.stats.add(Counter::BytesReclaimed, reclaimed_bytes);
                info!(
                    path = %self.path.display(),
                    reclaimed_bytes,
                    carried_bytes,
                    "Truncated consumed log bytes"
                );
                self.publish(LifecycleEvent::Truncated {
                    path: self.path.clone(),
                    reclaimed_bytes,
                });
                self.persist();
            }
            Ok(TruncateOutcome::Skipped(reason)) => {
                debug!(path = %self.path.display(), reason = ?reason, "Truncation skipped");
            }
            Err(err) => warn!(path = %self.path.display(), error = %err, "Truncation failed"),
        }
    }

    fn finish(mut self) {
        if let Err(err) = self.pipeline.tick_at(now_ms()) {
            warn!(path = %self.path.display(), error = %err, "Final drain failed");
        }
        self.pipeline.tailer_mut().abandon_partial();
        self.watcher = None;
        self.dedup_dirty = true;
        self.persist();

        let offset = self.pipeline.tailer().watermark().offset;
        self.bus.publish(BusEvent::Lifecycle(LifecycleEvent::Stopped {
            path: self.path.clone(),
            offset,
        }));
        info!(path = %self.path.display(), offset, "Stopped watching");
    }

    fn publish(&self, event: LifecycleEvent) {
        self.bus.publish(BusEvent::Lifecycle(event));
    }
}

/// Resolve at the next retry deadline while backing off, otherwise at the
/// next tick or watcher signal.
async fn wait_for_work(waiter: &ChangeWaiter, interval: &mut Interval, retry_at: Option<Instant>) {
    match retry_at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => {
            tokio::select! {
                () = waiter.changed() => {}
                _ = interval.tick() => {}
            }
        }
    }
}
