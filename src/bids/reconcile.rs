use crate::bids::layout::SESSION_PREFIX;
use crate::bids::registry::{self, SessionId, SessionRecord, SessionRegistry, VisitStamp};
use crate::bids::warn::{self, WarnEvent};
use crate::error::{RegistryError, WarnCode};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDirName {
    Reconciled(SessionId),
    Raw(VisitStamp),
    Malformed,
}

pub fn classify_label(label: &str) -> SessionDirName {
    if let Some(id) = SessionId::from_label(label) {
        return SessionDirName::Reconciled(id);
    }
    match VisitStamp::parse_raw(label) {
        Some(stamp) => SessionDirName::Raw(stamp),
        None => SessionDirName::Malformed,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub label: String,
    pub stamp: VisitStamp,
    pub id: SessionId,
    /// The registry already holds this row from an interrupted run; only
    /// the rename is still outstanding.
    pub resume: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub assignments: Vec<Assignment>,
    pub already_reconciled: Vec<(String, SessionId)>,
    pub malformed: Vec<String>,
}

/// Pure planning step. Raw visits are taken oldest first.
pub fn plan(
    labels: &[String],
    registry: &SessionRegistry,
    max_ordinal: u32,
) -> Result<ReconcilePlan, RegistryError> {
    let mut out = ReconcilePlan::default();
    let mut taken = BTreeSet::new();
    let mut raw = Vec::new();
    for label in labels {
        match classify_label(label) {
            SessionDirName::Reconciled(id) => {
                taken.insert(id);
            }
            SessionDirName::Raw(stamp) => raw.push((label.clone(), stamp)),
            SessionDirName::Malformed => out.malformed.push(label.clone()),
        }
    }
    // Stable: equal dates stay in discovery order.
    raw.sort_by_key(|(_, stamp)| stamp.date);

    let mut working = registry.clone();
    let mut next = 1u32;
    for (label, stamp) in raw {
        if let Some(id) = working.id_of(&stamp) {
            if taken.contains(&id) {
                out.already_reconciled.push((label, id));
            } else {
                taken.insert(id);
                out.assignments.push(Assignment {
                    label,
                    stamp,
                    id,
                    resume: true,
                });
            }
            continue;
        }

        let mut ordinal = next;
        let id = loop {
            if ordinal > max_ordinal {
                return Err(RegistryError::Exhausted { max: max_ordinal });
            }
            let candidate = SessionId::new(ordinal).ok_or(RegistryError::Exhausted {
                max: max_ordinal,
            })?;
            // Free means: no reconciled directory uses it and the registry
            // does not bind it to another visit.
            if !taken.contains(&candidate) && working.stamp_of(candidate).is_none() {
                break candidate;
            }
            ordinal += 1;
        };
        working.insert(SessionRecord::new(id, stamp.clone()))?;
        taken.insert(id);
        next = ordinal + 1;
        out.assignments.push(Assignment {
            label,
            stamp,
            id,
            resume: false,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub renamed: Vec<(String, SessionId)>,
    pub files_renamed: usize,
    pub already_reconciled: usize,
    pub registry_path: Option<PathBuf>,
    pub registry_changed: bool,
    pub warnings: Vec<String>,
}

fn session_labels(subject_dir: &Path) -> Result<Vec<String>> {
    let mut labels = Vec::new();
    for entry in fs::read_dir(subject_dir)
        .with_context(|| format!("failed to read {}", subject_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(label) = name.strip_prefix(SESSION_PREFIX) {
            labels.push(label.to_string());
        }
    }
    // Discovery order is name order.
    labels.sort();
    Ok(labels)
}

fn rename_session(subject_dir: &Path, label: &str, id: SessionId) -> Result<usize> {
    let from = subject_dir.join(format!("{SESSION_PREFIX}{label}"));
    let to = subject_dir.join(id.to_string());
    if to.exists() {
        anyhow::bail!(
            "refusing to rename {}: {} already exists",
            from.display(),
            to.display()
        );
    }
    fs::rename(&from, &to)
        .with_context(|| format!("failed to rename {} to {}", from.display(), to.display()))?;
    tracing::debug!("renamed {} to {}", from.display(), to.display());
    rewrite_session_tokens(&to, label, id)
}

fn rewrite_session_tokens(session_dir: &Path, label: &str, id: SessionId) -> Result<usize> {
    let old_token = format!("{SESSION_PREFIX}{label}");
    let new_token = id.to_string();
    let files = WalkDir::new(session_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect::<Vec<_>>();

    let mut renamed = 0usize;
    for file in files {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.contains(&old_token) {
            continue;
        }
        let target = file.with_file_name(name.replace(&old_token, &new_token));
        if target.exists() {
            anyhow::bail!(
                "refusing to rename {}: {} already exists",
                file.display(),
                target.display()
            );
        }
        fs::rename(&file, &target).with_context(|| {
            format!("failed to rename {} to {}", file.display(), target.display())
        })?;
        renamed += 1;
    }
    Ok(renamed)
}

pub fn reconcile_subject(subject_dir: &Path, max_ordinal: u32) -> Result<ReconcileOutcome> {
    let subject = subject_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut registry = registry::load(subject_dir)?;
    let labels = session_labels(subject_dir)?;
    let plan = plan(&labels, &registry, max_ordinal)?;

    let mut out = ReconcileOutcome {
        already_reconciled: plan.already_reconciled.len(),
        ..ReconcileOutcome::default()
    };

    for label in &plan.malformed {
        out.warnings.push(warn::emit(WarnEvent {
            code: WarnCode::W006MalformedSession,
            stage: "reconcile",
            action: "skip-session",
            subject: &subject,
            session: label,
            reason: "neither-session-id-nor-date-stamp",
            ..WarnEvent::default()
        }));
    }
    for (label, id) in &plan.already_reconciled {
        out.warnings.push(warn::emit(WarnEvent {
            code: WarnCode::W007SessionAlreadyReconciled,
            stage: "reconcile",
            action: "leave-for-inspection",
            subject: &subject,
            session: label,
            reason: &format!("visit already reconciled as {id}"),
            ..WarnEvent::default()
        }));
    }

    // A run killed between a directory rename and its file renames leaves
    // the raw token in file names under `ses-NNN`.
    for label in &labels {
        let SessionDirName::Reconciled(id) = classify_label(label) else {
            continue;
        };
        let Some(stamp) = registry.stamp_of(id) else {
            continue;
        };
        let repaired =
            rewrite_session_tokens(&subject_dir.join(id.to_string()), &stamp.raw_label(), id)?;
        if repaired > 0 {
            tracing::info!("{subject}: repaired {repaired} file name(s) under {id}");
            out.files_renamed += repaired;
        }
    }

    for assignment in &plan.assignments {
        if !assignment.resume {
            // Write-ahead: the row is durable before the directory moves.
            registry.insert(SessionRecord::new(assignment.id, assignment.stamp.clone()))?;
            out.registry_path = Some(registry::save(subject_dir, &registry)?);
            out.registry_changed = true;
        }
        out.files_renamed += rename_session(subject_dir, &assignment.label, assignment.id)?;
        out.renamed.push((assignment.label.clone(), assignment.id));
    }

    let path = registry::registry_path(subject_dir);
    if !path.exists() {
        out.registry_path = Some(registry::save(subject_dir, &registry)?);
        out.registry_changed = true;
    } else if out.registry_path.is_none() {
        out.registry_path = Some(path);
    }

    Ok(out)
}
