//! Reclaims consumed bytes from the front of the hook log.
//!
//! The hook only ever appends, so the file grows without bound. Rotation
//! copies the unread tail `[watermark, EOF)` into a sibling temp file,
//! catches up with anything appended during the copy, and renames the temp
//! file over the log. Readers holding the old inode drain it as a normal
//! rotation; the tailer adopts the new identity at offset 0.
//!
//! ```text
//! terminal.log:   [ consumed .......... | unread ]
//!                                       ^ watermark
//! .terminal.log.rotate:                 [ unread | appended meanwhile ]
//!                    rename ──► terminal.log (new inode, watermark 0)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TruncatorConfig;
use crate::error::{Error, Result};
use crate::tailer::{FileIdentity, Watermark};

/// Copy passes after the first one, chasing a writer that keeps appending.
const CATCH_UP_PASSES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    /// The file at the path is not the one the watermark refers to
    IdentityMismatch,
    NothingConsumed,
    FileMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncateOutcome {
    Skipped(SkipReason),
    Rotated {
        /// Consumed bytes dropped from the front
        reclaimed_bytes: u64,
        /// Unread bytes moved into the new file
        carried_bytes: u64,
        /// Watermark in the new file: its identity at offset 0
        new_watermark: Watermark,
    },
}

pub struct Truncator {
    path: PathBuf,
    config: TruncatorConfig,
    /// Construction time until the first rotation
    last_run: Instant,
}

impl Truncator {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: &TruncatorConfig) -> Self {
        Self {
            path: path.into(),
            config: config.clone(),
            last_run: Instant::now(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling temp file used while rotating.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "terminal.log".to_string());
        self.path.with_file_name(format!(".{name}.rotate"))
    }

    /// Whether a rotation is due for a file of `size` bytes with `consumed`
    /// bytes behind the watermark.
    #[must_use]
    pub fn should_run(&self, size: u64, consumed: u64, now: Instant) -> bool {
        if !self.config.enabled || consumed < self.config.min_consumed_bytes.max(1) {
            return false;
        }
        if size >= self.config.max_bytes {
            return true;
        }
        self.config.interval_secs > 0
            && now.saturating_duration_since(self.last_run)
                >= Duration::from_secs(self.config.interval_secs)
    }

    /// Drop everything before `up_to.offset`.
    ///
    /// # Errors
    ///
    /// [`Error::RotationRace`] when the file is replaced or shrinks while the
    /// tail is being copied; the temp file is removed and the log untouched.
    pub fn truncate(&mut self, up_to: &Watermark, now: Instant) -> Result<TruncateOutcome> {
        if !self.config.enabled {
            return Ok(TruncateOutcome::Skipped(SkipReason::Disabled));
        }
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(TruncateOutcome::Skipped(SkipReason::FileMissing));
            }
            Err(err) => return Err(err.into()),
        };
        let identity = FileIdentity::of(&meta);
        if up_to.identity != Some(identity) || up_to.offset > meta.len() {
            debug!(path = %self.path.display(), "Watermark does not match log file; not truncating");
            return Ok(TruncateOutcome::Skipped(SkipReason::IdentityMismatch));
        }
        if up_to.offset == 0 {
            return Ok(TruncateOutcome::Skipped(SkipReason::NothingConsumed));
        }

        self.last_run = now;
        let temp = self.temp_path();
        match self.rotate(identity, up_to.offset, &temp, &mut || {}) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&temp) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(path = %temp.display(), error = %cleanup, "Failed to remove rotation temp file");
                    }
                }
                Err(err)
            }
        }
    }

    /// `after_sync` runs between the temp-file fsync and the final catch-up.
    fn rotate(
        &self,
        identity: FileIdentity,
        offset: u64,
        temp: &Path,
        after_sync: &mut dyn FnMut(),
    ) -> Result<TruncateOutcome> {
        let race = || Error::RotationRace {
            path: self.path.clone(),
        };

        let mut source = File::open(&self.path)?;
        let source_meta = source.metadata()?;
        if FileIdentity::of(&source_meta) != identity {
            return Err(race());
        }

        let mut dest = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp)?;
        dest.set_permissions(source_meta.permissions())?;

        source.seek(SeekFrom::Start(offset))?;
        let mut position = offset + io::copy(&mut source, &mut dest)?;
        for _ in 0..CATCH_UP_PASSES {
            let len = source.metadata()?.len();
            if len < position {
                return Err(race());
            }
            if len == position {
                break;
            }
            position += io::copy(&mut source, &mut dest)?;
        }
        dest.sync_all()?;
        after_sync();

        // Catch up on writes that landed during the fsync; the rename follows
        // immediately, the temp inode is synced again below.
        match fs::metadata(&self.path) {
            Ok(meta) if FileIdentity::of(&meta) == identity && meta.len() >= position => {
                position += io::copy(&mut source, &mut dest)?;
            }
            _ => return Err(race()),
        }
        fs::rename(temp, &self.path)?;

        // A write to the old inode between the catch-up and the rename is
        // appended after anything already written to the new file, so those
        // lines can be delivered out of order. Accepted.
        let late = source.metadata()?.len().saturating_sub(position);
        if late > 0 {
            warn!(
                path = %self.path.display(),
                late_bytes = late,
                "Lines written during rotation may be reordered"
            );
            let mut tail = OpenOptions::new().append(true).open(&self.path)?;
            position += io::copy(&mut source, &mut tail)?;
        }
        dest.sync_all()?;
        sync_parent(&self.path);

        let new_identity = FileIdentity::of(&fs::metadata(&self.path)?);
        let carried_bytes = position - offset;
        info!(
            path = %self.path.display(),
            reclaimed_bytes = offset,
            carried_bytes,
            "Log file truncated"
        );
        Ok(TruncateOutcome::Rotated {
            reclaimed_bytes: offset,
            carried_bytes,
            new_watermark: Watermark {
                identity: Some(new_identity),
                offset: 0,
            },
        })
    }
}

fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(path = %parent.display(), error = %err, "Directory fsync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> TruncatorConfig {
        TruncatorConfig {
            enabled: true,
            max_bytes: 1024,
            min_consumed_bytes: 4,
            interval_secs: 300,
        }
    }

    fn write_log(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("terminal.log");
        fs::write(&path, content).unwrap();
        path
    }

    fn watermark_at(path: &Path, offset: u64) -> Watermark {
        Watermark {
            identity: Some(FileIdentity::of(&fs::metadata(path).unwrap())),
            offset,
        }
    }

    #[test]
    fn rotation_keeps_only_unread_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), b"old 1\nold 2\nnew 3\npart");
        let mut truncator = Truncator::new(&path, &config());
        let outcome = truncator
            .truncate(&watermark_at(&path, 12), Instant::now())
            .unwrap();

        let TruncateOutcome::Rotated {
            reclaimed_bytes,
            carried_bytes,
            new_watermark,
        } = outcome
        else {
            panic!("expected rotation");
        };
        assert_eq!(reclaimed_bytes, 12);
        assert_eq!(carried_bytes, 10);
        assert_eq!(fs::read(&path).unwrap(), b"new 3\npart");
        assert_eq!(new_watermark, watermark_at(&path, 0));
        assert!(!truncator.temp_path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn rotation_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), b"a\nb\n");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        let mut truncator = Truncator::new(&path, &config());
        truncator
            .truncate(&watermark_at(&path, 2), Instant::now())
            .unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn stale_identity_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), b"a\nb\n");
        let stale = watermark_at(&path, 2);
        let replacement = dir.path().join("next.log");
        fs::write(&replacement, b"x\ny\nz\n").unwrap();
        fs::rename(&replacement, &path).unwrap();

        let mut truncator = Truncator::new(&path, &config());
        assert_eq!(
            truncator.truncate(&stale, Instant::now()).unwrap(),
            TruncateOutcome::Skipped(SkipReason::IdentityMismatch)
        );
        assert_eq!(fs::read(&path).unwrap(), b"x\ny\nz\n");
    }

    #[test]
    fn nothing_consumed_or_missing_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), b"a\n");
        let mut truncator = Truncator::new(&path, &config());
        assert_eq!(
            truncator.truncate(&watermark_at(&path, 0), Instant::now()).unwrap(),
            TruncateOutcome::Skipped(SkipReason::NothingConsumed)
        );
        let mark = watermark_at(&path, 1);
        fs::remove_file(&path).unwrap();
        assert_eq!(
            truncator.truncate(&mark, Instant::now()).unwrap(),
            TruncateOutcome::Skipped(SkipReason::FileMissing)
        );
    }

    #[test]
    fn appends_after_rotation_land_in_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), b"done\n");
        let mut truncator = Truncator::new(&path, &config());
        truncator
            .truncate(&watermark_at(&path, 5), Instant::now())
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"fresh\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"fresh\n");
    }

    #[test]
    fn writes_during_fsync_are_carried_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), b"read\nunread\n");
        let truncator = Truncator::new(&path, &config());
        let mark = watermark_at(&path, 5);
        let identity = mark.identity.unwrap();

        let mut writes = 0;
        let outcome = truncator
            .rotate(identity, mark.offset, &truncator.temp_path(), &mut || {
                let mut file = OpenOptions::new().append(true).open(&path).unwrap();
                file.write_all(b"during\n").unwrap();
                writes += 1;
            })
            .unwrap();

        assert_eq!(writes, 1);
        assert!(matches!(outcome, TruncateOutcome::Rotated { carried_bytes: 14, .. }));
        assert_eq!(fs::read(&path).unwrap(), b"unread\nduring\n");

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"after\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"unread\nduring\nafter\n");
    }

    #[test]
    fn should_run_thresholds() {
        let truncator = Truncator::new("/tmp/terminal.log", &config());
        let now = Instant::now();
        assert!(truncator.should_run(2048, 1024, now), "size threshold");
        assert!(!truncator.should_run(2048, 2, now), "too little consumed");
        assert!(!truncator.should_run(100, 50, now), "cadence not yet elapsed");
        assert!(truncator.should_run(100, 50, now + Duration::from_secs(301)), "cadence elapsed");

        let disabled = Truncator::new(
            "/tmp/terminal.log",
            &TruncatorConfig {
                enabled: false,
                ..config()
            },
        );
        assert!(!disabled.should_run(u64::MAX, u64::MAX, now));
    }

    #[test]
    fn cadence_waits_for_interval_after_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), b"one\ntwo\n");
        let mut truncator = Truncator::new(&path, &config());
        let start = Instant::now();
        truncator
            .truncate(&watermark_at(&path, 4), start)
            .unwrap();
        assert!(!truncator.should_run(100, 50, start + Duration::from_secs(10)));
        assert!(truncator.should_run(100, 50, start + Duration::from_secs(300)));
    }
}
