use crate::bids::paths::BidsPaths;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;

/// Exclusive hold on the working state (ledger, scratch root, registries)
/// for one process. Released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl RunLock {
    pub fn acquire(paths: &BidsPaths) -> Result<Self> {
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;
        let path = &paths.lock_file;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "another mspaths2bids run holds {}; wait for it to finish",
                path.display()
            )
        })?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // The file itself stays; unlinking it would let a waiter lock an
        // orphaned inode.
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_is_refused_until_release() {
        let tmp = tempdir().expect("tempdir");
        let paths = BidsPaths::rooted_at(tmp.path().join("state"), tmp.path().join("scratch"));

        let first = RunLock::acquire(&paths).expect("first");
        assert!(RunLock::acquire(&paths).is_err());
        drop(first);
        RunLock::acquire(&paths).expect("after release");
    }
}
