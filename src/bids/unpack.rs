use crate::bids::util::is_label;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// `<scratch>/<prefix>_<subject>/<session>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitDir {
    pub subject: String,
    pub session: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedVisit {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct UnpackOutcome {
    pub visits: Vec<VisitDir>,
    pub malformed: Vec<MalformedVisit>,
}

const SCRATCH_PREFIX: &str = "bundle-";

/// Removed on drop.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn acquire(scratch_root: &Path) -> Result<Self> {
        fs::create_dir_all(scratch_root)
            .with_context(|| format!("failed to create {}", scratch_root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(scratch_root)
            .with_context(|| format!("failed to create scratch dir in {}", scratch_root.display()))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Callers must hold the run lock so no live archive is swept.
pub fn clear_stale_scratch(scratch_root: &Path) -> Result<usize> {
    if !scratch_root.is_dir() {
        return Ok(0);
    }
    let mut removed = 0usize;
    for path in sorted_dir_entries(scratch_root)? {
        let stale = path.is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(SCRATCH_PREFIX));
        if !stale {
            continue;
        }
        fs::remove_dir_all(&path)
            .with_context(|| format!("failed to remove stale scratch {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(())
}

fn extract_zip(archive_path: &Path, extract_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open archive {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("invalid zip archive {}", archive_path.display()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("failed to read zip entry {i}"))?;

        // Entries that would escape the extraction root are dropped.
        let Some(relative) = entry.enclosed_name() else {
            tracing::debug!("skipping unsafe zip entry {}", entry.name());
            continue;
        };
        let outpath = extract_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)
                .with_context(|| format!("failed to create {}", outpath.display()))?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut outfile = File::create(&outpath)
            .with_context(|| format!("failed to create {}", outpath.display()))?;
        std::io::copy(&mut entry, &mut outfile)
            .with_context(|| format!("failed to extract {}", outpath.display()))?;
    }

    Ok(())
}

fn sorted_dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    out.sort();
    Ok(out)
}

/// `MSPATHS_12345` -> `12345`. The subject is the second `_` field.
pub fn subject_from_bundle_dir(name: &str) -> Option<&str> {
    let mut parts = name.split('_');
    let _prefix = parts.next().filter(|p| !p.is_empty())?;
    parts.next().filter(|subject| is_label(subject))
}

fn enumerate_visits(root: &Path) -> Result<UnpackOutcome> {
    let mut out = UnpackOutcome::default();
    for subject_dir in sorted_dir_entries(root)? {
        if !subject_dir.is_dir() {
            tracing::debug!("ignoring stray file {}", subject_dir.display());
            continue;
        }
        let name = subject_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(subject) = subject_from_bundle_dir(&name) else {
            out.malformed.push(MalformedVisit {
                path: subject_dir.clone(),
                reason: format!("directory `{name}` is not `<prefix>_<subject>`"),
            });
            continue;
        };

        for visit_dir in sorted_dir_entries(&subject_dir)? {
            if !visit_dir.is_dir() {
                continue;
            }
            let session = visit_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !is_label(&session) {
                out.malformed.push(MalformedVisit {
                    path: visit_dir.clone(),
                    reason: format!("visit `{session}` is not a usable session label"),
                });
                continue;
            }
            out.visits.push(VisitDir {
                subject: subject.to_string(),
                session,
                path: visit_dir,
            });
        }
    }
    Ok(out)
}

/// An error means the whole archive is unusable.
pub fn unpack(archive: &Path, scratch_dir: &Path) -> Result<UnpackOutcome> {
    reset_dir(scratch_dir)?;
    extract_zip(archive, scratch_dir)?;
    enumerate_visits(scratch_dir)
}
