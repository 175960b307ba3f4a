//! Best-effort state that survives restarts.
//!
//! The state directory holds the tail watermark and the reducer's dedup
//! window as small JSON documents, each replaced atomically (write to a temp
//! file, fsync, rename). `onibi.lock` is held with an exclusive advisory lock
//! for as long as the [`StateStore`] lives, so two watchers never share a
//! state directory.
//!
//! Anything unreadable is ignored with a warning: a lost watermark only costs
//! a re-read, never a crash.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StateError;
use crate::reducer::DedupSnapshot;
use crate::tailer::Watermark;

/// Format version of every state document.
pub const STATE_VERSION: u32 = 1;

pub const WATERMARK_FILE: &str = "watermark.json";
pub const DEDUP_FILE: &str = "dedup_window.json";
pub const LOCK_FILE: &str = "onibi.lock";

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkDocument {
    version: u32,
    path: PathBuf,
    watermark: Watermark,
    saved_at_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DedupDocument {
    version: u32,
    #[serde(flatten)]
    snapshot: DedupSnapshot,
}

/// Locked handle on the state directory.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    _lock: File,
}

impl StateStore {
    /// Create (mode `0700`) and lock the state directory.
    ///
    /// # Errors
    ///
    /// [`StateError::Locked`] when another process holds the lock.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StateError::Write { path, source }
        };

        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(write_err(&dir))?;
            #[cfg(unix)]
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).map_err(write_err(&dir))?;
        }

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(write_err(&lock_path))?;
        match FileExt::try_lock_exclusive(&lock) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(StateError::Locked(dir));
            }
            Err(source) => {
                return Err(StateError::Write {
                    path: lock_path,
                    source,
                });
            }
        }

        debug!(path = %dir.display(), "State directory locked");
        Ok(Self { dir, _lock: lock })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The watermark saved for `log_path`, if any.
    #[must_use]
    pub fn load_watermark(&self, log_path: &Path) -> Option<Watermark> {
        let doc: WatermarkDocument = self.read_document(WATERMARK_FILE)?;
        if doc.path != log_path {
            warn!(
                path = %log_path.display(),
                saved_for = %doc.path.display(),
                "Saved watermark belongs to another log file; ignoring"
            );
            return None;
        }
        Some(doc.watermark)
    }

    pub fn save_watermark(
        &self,
        log_path: &Path,
        watermark: Watermark,
        now_ms: u64,
    ) -> Result<(), StateError> {
        let doc = WatermarkDocument {
            version: STATE_VERSION,
            path: log_path.to_path_buf(),
            watermark,
            saved_at_ms: now_ms,
        };
        self.write_document(WATERMARK_FILE, &doc)
    }

    #[must_use]
    pub fn load_dedup(&self) -> Option<DedupSnapshot> {
        let doc: DedupDocument = self.read_document(DEDUP_FILE)?;
        Some(doc.snapshot)
    }

    pub fn save_dedup(&self, snapshot: &DedupSnapshot) -> Result<(), StateError> {
        let doc = DedupDocument {
            version: STATE_VERSION,
            snapshot: snapshot.clone(),
        };
        self.write_document(DEDUP_FILE, &doc)
    }

    fn read_document<T: DeserializeOwned + HasVersion>(&self, name: &str) -> Option<T> {
        let path = self.dir.join(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to read state file; ignoring");
                return None;
            }
        };
        match serde_json::from_str::<T>(&text) {
            Ok(doc) if doc.version() == STATE_VERSION => Some(doc),
            Ok(doc) => {
                warn!(path = %path.display(), version = doc.version(), "Unknown state version; ignoring");
                None
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Corrupt state file; ignoring");
                None
            }
        }
    }

    fn write_document<T: Serialize>(&self, name: &str, doc: &T) -> Result<(), StateError> {
        let path = self.dir.join(name);
        let bytes = serde_json::to_vec_pretty(doc).map_err(|err| StateError::Write {
            path: path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        })?;
        write_atomic(&path, &bytes).map_err(|source| StateError::Write { path, source })
    }
}

trait HasVersion {
    fn version(&self) -> u32;
}

impl HasVersion for WatermarkDocument {
    fn version(&self) -> u32 {
        self.version
    }
}

impl HasVersion for DedupDocument {
    fn version(&self) -> u32 {
        self.version
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        #[cfg(unix)]
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectorId, Fingerprint};
    use crate::reducer::DedupEntry;
    use crate::tailer::FileIdentity;
    use std::collections::BTreeSet;

    fn watermark() -> Watermark {
        Watermark {
            identity: Some(FileIdentity {
                device: 7,
                inode: 99,
            }),
            offset: 1234,
        }
    }

    #[test]
    fn watermark_roundtrips_for_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state")).unwrap();
        let log = Path::new("/home/u/.config/onibi/terminal.log");
        assert_eq!(store.load_watermark(log), None);
        store.save_watermark(log, watermark(), 1).unwrap();
        assert_eq!(store.load_watermark(log), Some(watermark()));
        assert_eq!(store.load_watermark(Path::new("/elsewhere.log")), None);
    }

    #[test]
    fn dedup_window_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let snapshot = DedupSnapshot {
            window_ms: 5_000,
            entries: vec![DedupEntry {
                fingerprint: Fingerprint::from("abcd".to_string()),
                confirmed_at_ms: 42,
                detectors: BTreeSet::from([DetectorId::AiResponse]),
            }],
        };
        store.save_dedup(&snapshot).unwrap();
        assert_eq!(store.load_dedup(), Some(snapshot));

        let text = fs::read_to_string(dir.path().join(DEDUP_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["version"], STATE_VERSION);
        assert_eq!(json["entries"][0]["detectors"][0], "ai_response");
    }

    #[test]
    fn corrupt_or_future_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(WATERMARK_FILE), "{not json").unwrap();
        assert_eq!(store.load_watermark(Path::new("/x")), None);

        fs::write(
            dir.path().join(DEDUP_FILE),
            r#"{"version": 99, "window_ms": 1, "entries": []}"#,
        )
        .unwrap();
        assert_eq!(store.load_dedup(), None);
    }

    #[test]
    fn second_store_on_same_dir_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let _first = StateStore::open(dir.path()).unwrap();
        let second = StateStore::open(dir.path());
        assert!(matches!(second, Err(StateError::Locked(_))));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        drop(StateStore::open(dir.path()).unwrap());
        assert!(StateStore::open(dir.path()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn state_files_are_private() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let store = StateStore::open(&state).unwrap();
        store.save_watermark(Path::new("/x"), watermark(), 0).unwrap();
        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&state), 0o700);
        assert_eq!(mode(&state.join(WATERMARK_FILE)), 0o600);
        assert!(!state.join("watermark.json.tmp").exists());
    }
}
