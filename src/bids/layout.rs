use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const SUBJECT_PREFIX: &str = "sub-";
pub const SESSION_PREFIX: &str = "ses-";
pub const ANAT_DIR: &str = "anat";

pub fn subject_dir(target_root: &Path, subject: &str) -> PathBuf {
    target_root.join(format!("{SUBJECT_PREFIX}{subject}"))
}

pub fn anat_dir(target_root: &Path, subject: &str, session: &str) -> PathBuf {
    subject_dir(target_root, subject)
        .join(format!("{SESSION_PREFIX}{session}"))
        .join(ANAT_DIR)
}

/// `sub-<subject>_ses-<session>_<suffix>.<ext>`
pub fn derivative_file_name(subject: &str, session: &str, suffix: &str, ext: &str) -> String {
    format!("{SUBJECT_PREFIX}{subject}_{SESSION_PREFIX}{session}_{suffix}.{ext}")
}

pub fn sessions_tsv_path(subject_dir: &Path, subject: &str) -> PathBuf {
    subject_dir.join(format!("{SUBJECT_PREFIX}{subject}_sessions.tsv"))
}

/// Subject id of a `sub-<id>` directory name.
pub fn subject_id_from_dir_name(name: &str) -> Option<&str> {
    name.strip_prefix(SUBJECT_PREFIX).filter(|id| !id.is_empty())
}

/// Subject identifiers present under `target_root`, sorted.
pub fn known_subject_ids(target_root: &Path) -> Result<Vec<String>> {
    if !target_root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(target_root)
        .with_context(|| format!("failed to read {}", target_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(id) = subject_id_from_dir_name(&name) {
            out.push(id.to_string());
        }
    }
    out.sort();
    Ok(out)
}
