use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LEDGER_VERSION: u32 = 1;

/// Position of the last line already attributed to a log source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub offset: u64,
    /// Identity of the file generation the offset belongs to.
    #[serde(default)]
    pub inode: Option<u64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_timestamp: Option<OffsetDateTime>,
}

impl Cursor {
    /// A cursor may only move forward within one file generation.
    pub fn permits(&self, next: &Cursor) -> bool {
        next.inode != self.inode || next.offset >= self.offset
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    cursors: BTreeMap<String, Cursor>,
}

/// Durable mapping of source id to cursor.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    cursors: BTreeMap<String, Cursor>,
}

impl Ledger {
    /// Loads the ledger file; a missing or unreadable file is a cold start.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cursors = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<LedgerFile>(&bytes) {
                Ok(file) => file.cursors,
                Err(e) => {
                    warn!(
                        "ledger {} is corrupt ({e}), starting from an empty ledger",
                        path.display()
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no ledger at {}, cold start", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                warn!("unable to read ledger {}: {e}", path.display());
                BTreeMap::new()
            }
        };

        Ledger { path, cursors }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self, source_id: &str) -> Option<Cursor> {
        self.cursors.get(source_id).copied()
    }

    pub fn cursors(&self) -> &BTreeMap<String, Cursor> {
        &self.cursors
    }

    /// Records a new cursor. Returns `false` if it would move backwards.
    pub fn update(&mut self, source_id: &str, cursor: Cursor) -> bool {
        match self.cursors.get_mut(source_id) {
            Some(current) if !current.permits(&cursor) => {
                warn!(
                    "refusing to move cursor of {source_id} back from {} to {}",
                    current.offset, cursor.offset
                );
                false
            }
            Some(current) => {
                *current = cursor;
                true
            }
            None => {
                self.cursors.insert(source_id.to_owned(), cursor);
                true
            }
        }
    }

    /// Replaces the cursor of a source whose file was rotated or truncated in place.
    pub fn reset(&mut self, source_id: &str, cursor: Cursor) {
        if let Some(previous) = self.cursors.insert(source_id.to_owned(), cursor) {
            debug!(
                "cursor of {source_id} restarts at {} (was {})",
                cursor.offset, previous.offset
            );
        }
    }

    /// Writes the ledger with write-temp-then-rename.
    pub fn flush(&self) -> io::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let file = LedgerFile {
            version: LEDGER_VERSION,
            cursors: self.cursors.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger".to_owned());
        let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
        {
            let mut out = fs::File::create(&tmp)?;
            out.write_all(&json)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(
            "ledger flushed to {} ({} cursors)",
            self.path.display(),
            self.cursors.len()
        );
        Ok(())
    }
}
