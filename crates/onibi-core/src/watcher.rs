//! Filesystem change notifications for the hook log.
//!
//! The watcher observes the log's parent directory (so a replacement file is
//! seen) and reduces raw `notify` events for the target file to three
//! signals. It never reads file content.
//!
//! Signals raised between two [`FileWatcher::take`] calls coalesce into one
//! [`SignalSet`] held in a single atomic, so the notification thread never
//! blocks and never drops a signal while the watcher is alive.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{WatchBackend, WatchConfig};
use crate::error::WatchError;

/// A coarse change notification for the watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSignal {
    /// Data may have been appended
    Appended,
    /// A file appeared at the path (created, or renamed into place)
    Rotated,
    /// The file at the path was removed or renamed away
    Deleted,
}

impl ChangeSignal {
    const fn bit(self) -> u8 {
        match self {
            Self::Appended => 0b001,
            Self::Rotated => 0b010,
            Self::Deleted => 0b100,
        }
    }
}

/// Coalesced set of signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSet(u8);

impl SignalSet {
    #[must_use]
    pub fn contains(self, signal: ChangeSignal) -> bool {
        self.0 & signal.bit() != 0
    }

    pub fn insert(&mut self, signal: ChangeSignal) {
        self.0 |= signal.bit();
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (signal, name) in [
            (ChangeSignal::Appended, "appended"),
            (ChangeSignal::Rotated, "rotated"),
            (ChangeSignal::Deleted, "deleted"),
        ] {
            if self.contains(signal) {
                names.push(name);
            }
        }
        write!(f, "[{}]", names.join(","))
    }
}

#[derive(Debug, Default)]
struct SignalSlot {
    bits: AtomicU8,
    wake: Notify,
}

impl SignalSlot {
    fn raise(&self, signal: ChangeSignal) {
        self.bits.fetch_or(signal.bit(), Ordering::AcqRel);
        self.wake.notify_one();
    }

    fn take(&self) -> SignalSet {
        SignalSet(self.bits.swap(0, Ordering::AcqRel))
    }
}

/// Cloneable handle for awaiting signals without borrowing the watcher.
#[derive(Debug, Clone)]
pub struct ChangeWaiter {
    slot: Arc<SignalSlot>,
}

impl ChangeWaiter {
    /// Resolve when a signal has been raised since the previous wake-up.
    pub async fn changed(&self) {
        self.slot.wake.notified().await;
    }
}

/// Watches a single log path.
pub struct FileWatcher {
    path: PathBuf,
    dir: PathBuf,
    target: OsString,
    config: WatchConfig,
    backend: WatchBackend,
    watcher: Option<Box<dyn Watcher + Send>>,
    slot: Arc<SignalSlot>,
    deleted: bool,
}

impl FileWatcher {
    /// Start watching `path`. Its parent directory must exist.
    pub fn watch(path: &Path, config: &WatchConfig) -> Result<Self, WatchError> {
        let (dir, target) = split_path(path)?;
        if !dir.is_dir() {
            return Err(WatchError::MissingDirectory(dir));
        }
        let mut watcher = Self {
            path: path.to_path_buf(),
            dir,
            target,
            config: config.clone(),
            backend: config.backend,
            watcher: None,
            slot: Arc::new(SignalSlot::default()),
            deleted: false,
        };
        watcher.install()?;
        Ok(watcher)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backend actually in use (`Native` or `Poll`).
    #[must_use]
    pub fn backend(&self) -> WatchBackend {
        self.backend
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    #[must_use]
    pub fn waiter(&self) -> ChangeWaiter {
        ChangeWaiter {
            slot: Arc::clone(&self.slot),
        }
    }

    pub fn inject(&self, signal: ChangeSignal) {
        self.slot.raise(signal);
    }

    /// Take every signal raised since the last call.
    ///
    /// Once the file has been deleted, `Deleted` is reported on every call
    /// until [`FileWatcher::rewatch`] succeeds.
    pub fn take(&mut self) -> SignalSet {
        let mut set = self.slot.take();
        if set.contains(ChangeSignal::Deleted) && !self.deleted {
            debug!(path = %self.path.display(), "Watched file deleted");
            self.deleted = true;
        }
        if self.deleted {
            set.insert(ChangeSignal::Deleted);
        }
        set
    }

    /// Resolve when a signal has been raised since the previous wake-up.
    pub async fn changed(&self) {
        self.slot.wake.notified().await;
    }

    /// Re-establish the watch after the file was replaced.
    pub fn rewatch(&mut self) -> Result<(), WatchError> {
        self.watcher = None;
        self.backend = self.config.backend;
        self.install()?;
        self.deleted = false;
        self.slot.raise(ChangeSignal::Rotated);
        info!(path = %self.path.display(), "Re-established watch on replacement file");
        Ok(())
    }

    fn install(&mut self) -> Result<(), WatchError> {
        match self.backend {
            WatchBackend::Native => self.install_native(),
            WatchBackend::Poll => self.install_poll(),
            WatchBackend::Auto => match self.install_native() {
                Ok(()) => Ok(()),
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "Native watcher unavailable; polling");
                    self.install_poll()
                }
            },
        }
    }

    fn install_native(&mut self) -> Result<(), WatchError> {
        let handler = event_handler(self.target.clone(), Arc::clone(&self.slot));
        let watcher = RecommendedWatcher::new(handler, notify::Config::default())
            .map_err(|source| WatchError::Backend {
                backend: "native",
                source,
            })?;
        self.attach(Box::new(watcher), WatchBackend::Native)
    }

    fn install_poll(&mut self) -> Result<(), WatchError> {
        let handler = event_handler(self.target.clone(), Arc::clone(&self.slot));
        let config = notify::Config::default().with_poll_interval(self.config.poll_interval());
        let watcher = PollWatcher::new(handler, config).map_err(|source| WatchError::Backend {
            backend: "poll",
            source,
        })?;
        self.attach(Box::new(watcher), WatchBackend::Poll)
    }

    fn attach(
        &mut self,
        mut watcher: Box<dyn Watcher + Send>,
        backend: WatchBackend,
    ) -> Result<(), WatchError> {
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Install {
                path: self.dir.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), backend = ?backend, "Watching log directory");
        self.watcher = Some(watcher);
        self.backend = backend;
        Ok(())
    }
}

fn split_path(path: &Path) -> Result<(PathBuf, OsString), WatchError> {
    let target = path
        .file_name()
        .ok_or_else(|| WatchError::InvalidPath(path.to_path_buf()))?
        .to_os_string();
    let dir = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("."),
        Some(parent) => parent.to_path_buf(),
        None => return Err(WatchError::InvalidPath(path.to_path_buf())),
    };
    Ok((dir, target))
}

fn event_handler(
    target: OsString,
    slot: Arc<SignalSlot>,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |res| match res {
        Ok(event) => {
            if let Some(signal) = classify(&event, &target) {
                slot.raise(signal);
            }
        }
        Err(err) => warn!(error = %err, "File watcher notify error"),
    }
}

/// Map a raw event to a signal for the file named `target`.
fn classify(event: &Event, target: &OsString) -> Option<ChangeSignal> {
    let is_target = |p: &PathBuf| p.file_name() == Some(target.as_os_str());
    let touches = event.paths.iter().any(is_target);

    match &event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => touches.then_some(ChangeSignal::Deleted),
            RenameMode::To => touches.then_some(ChangeSignal::Rotated),
            RenameMode::Both => {
                if event.paths.get(1).is_some_and(is_target) {
                    Some(ChangeSignal::Rotated)
                } else if event.paths.first().is_some_and(is_target) {
                    Some(ChangeSignal::Deleted)
                } else {
                    None
                }
            }
            RenameMode::Any | RenameMode::Other => touches.then_some(ChangeSignal::Rotated),
        },
        _ if !touches => None,
        EventKind::Create(_) => Some(ChangeSignal::Rotated),
        EventKind::Remove(_) => Some(ChangeSignal::Deleted),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(ChangeSignal::Appended),
        EventKind::Access(_) => None,
    }
}
