use crate::bids::warn::{self, WarnEvent};
use crate::error::WarnCode;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeSet<String>,
}

pub fn archive_key(archive: &Path) -> String {
    fs::canonicalize(archive)
        .unwrap_or_else(|_| archive.to_path_buf())
        .display()
        .to_string()
}

impl Ledger {
    /// An unreadable ledger fails open: every archive counts as unprocessed.
    pub fn load(path: &Path) -> Self {
        let entries = match read_entries(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn::emit(WarnEvent {
                    code: WarnCode::W009LedgerUnreadable,
                    stage: "ledger",
                    action: "load",
                    archive: &path.display().to_string(),
                    reason: "treating-all-archives-as-unprocessed",
                    err: &format!("{err:#}"),
                    ..WarnEvent::default()
                });
                BTreeSet::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_processed(&self, archive: &Path) -> bool {
        self.entries.contains(&archive_key(archive))
    }

    pub fn mark_processed(&mut self, archive: &Path) -> Result<()> {
        let key = archive_key(archive);
        if self.entries.contains(&key) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(format!("{key}\n").as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        self.entries.insert(key);
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect())
}
