use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

pub const LEDGER_FILE_NAME: &str = "processed_zipfiles.csv";
const LOCK_FILE_NAME: &str = ".mspaths2bids.lock";

/// Working-state locations for one process. Nothing here is global; the
/// struct is resolved once per command and handed down explicitly.
#[derive(Debug, Clone)]
pub struct BidsPaths {
    pub state_dir: PathBuf,
    pub ledger_file: PathBuf,
    pub scratch_root: PathBuf,
    pub logs_dir: PathBuf,
    pub lock_file: PathBuf,
}

impl BidsPaths {
    /// Layout rooted at `state_dir` with a scratch root next to it. Used by
    /// tests and by `resolve_paths` once the state dir is known.
    pub fn rooted_at(state_dir: PathBuf, scratch_root: PathBuf) -> Self {
        Self {
            ledger_file: state_dir.join(LEDGER_FILE_NAME),
            logs_dir: state_dir.join("logs"),
            lock_file: state_dir.join(LOCK_FILE_NAME),
            scratch_root,
            state_dir,
        }
    }
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<BidsPaths> {
    let cwd = env::current_dir().context("current working directory could not be resolved")?;
    let state_dir = env_or_default_path("MSP2BIDS_STATE_DIR", cwd);
    let scratch_root = env_or_default_path(
        "MSP2BIDS_SCRATCH_DIR",
        env::temp_dir().join("mspaths_to_bids"),
    );

    let mut paths = BidsPaths::rooted_at(state_dir, scratch_root);
    paths.ledger_file = env_or_default_path("MSP2BIDS_LEDGER_FILE", paths.ledger_file);
    paths.logs_dir = env_or_default_path("MSP2BIDS_LOGS_DIR", paths.logs_dir);
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_layout_keeps_state_files_together() {
        let paths = BidsPaths::rooted_at(PathBuf::from("/work"), PathBuf::from("/scratch"));
        assert_eq!(paths.ledger_file, PathBuf::from("/work/processed_zipfiles.csv"));
        assert_eq!(paths.logs_dir, PathBuf::from("/work/logs"));
        assert_eq!(paths.lock_file, PathBuf::from("/work/.mspaths2bids.lock"));
        assert_eq!(paths.scratch_root, PathBuf::from("/scratch"));
    }
}
