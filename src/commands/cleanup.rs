use anyhow::Result;
use std::path::PathBuf;

use crate::bids::audit;
use crate::bids::config::load_config;
use crate::bids::layout::{known_subject_ids, subject_dir};
use crate::bids::lock::RunLock;
use crate::bids::paths::resolve_paths;
use crate::bids::reconcile::reconcile_subject;
use crate::bids::warn::{self, WarnEvent};
use crate::commands::CommandReport;
use crate::error::WarnCode;

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub target: PathBuf,
}

pub fn run(opts: &CleanupOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let config = load_config()?;
    let mut report = CommandReport::new("cleanup");
    report.detail(format!("target={}", opts.target.display()));

    if !opts.target.is_dir() {
        report.issue(format!(
            "target dir does not exist: {}",
            opts.target.display()
        ));
        return Ok(report);
    }

    let _lock = RunLock::acquire(&paths)?;
    let subjects = known_subject_ids(&opts.target)?;
    tracing::info!("reconciling sessions of {} subject(s)", subjects.len());

    let mut renamed_total = 0usize;
    for (idx, subject) in subjects.iter().enumerate() {
        let dir = subject_dir(&opts.target, subject);
        tracing::debug!("[{}/{}] sub-{}", idx + 1, subjects.len(), subject);
        match reconcile_subject(&dir, config.sessions.max_ordinal) {
            Ok(outcome) => {
                renamed_total += outcome.renamed.len();
                for (label, id) in &outcome.renamed {
                    report.detail(format!("sub-{subject}: ses-{label} -> {id}"));
                }
                if let (true, Some(path)) = (outcome.registry_changed, &outcome.registry_path) {
                    report.detail(format!("sub-{subject}: registry {}", path.display()));
                }
                for warning in outcome.warnings {
                    report.warn(warning);
                }
                audit::record(
                    &paths,
                    "reconcile",
                    "ok",
                    &format!(
                        "sub-{subject} renamed={} files={} already={}",
                        outcome.renamed.len(),
                        outcome.files_renamed,
                        outcome.already_reconciled
                    ),
                );
            }
            Err(err) => {
                let err_text = format!("{err:#}");
                warn::emit(WarnEvent {
                    code: WarnCode::W010RegistryFailed,
                    stage: "reconcile",
                    action: "skip-subject",
                    subject,
                    reason: "subject-reconciliation-failed",
                    err: &err_text,
                    ..WarnEvent::default()
                });
                report.issue(format!("sub-{subject}: {err_text}"));
                audit::record(&paths, "reconcile", "failed", &format!("sub-{subject}"));
            }
        }
    }

    report.detail(format!(
        "summary subjects={} sessions_renamed={renamed_total}",
        subjects.len()
    ));
    Ok(report)
}
