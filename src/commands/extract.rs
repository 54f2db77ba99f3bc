use anyhow::Result;
use std::path::PathBuf;

use crate::bids::config::load_config;
use crate::bids::lock::RunLock;
use crate::bids::paths::resolve_paths;
use crate::bids::pipeline::{self, ArchiveStatus, PipelineContext, RunMode};
use crate::commands::{CommandReport, ensure_converter_available};

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub source: PathBuf,
    pub target: PathBuf,
    pub mode: RunMode,
}

pub fn run(opts: &ExtractOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let config = load_config()?;
    let mut report = CommandReport::new(match opts.mode {
        RunMode::Batch => "extract",
        RunMode::Single { .. } => "extract-bundle",
    });

    report.detail(format!("source={}", opts.source.display()));
    report.detail(format!("target={}", opts.target.display()));
    report.detail(format!("ledger_file={}", paths.ledger_file.display()));
    report.detail(format!("scratch_root={}", paths.scratch_root.display()));
    if let RunMode::Single { force: true } = opts.mode {
        report.detail("force: ledger check bypassed");
    }

    if !ensure_converter_available(config.converter.bin.as_deref(), &mut report) {
        return Ok(report);
    }

    let _lock = RunLock::acquire(&paths)?;
    let ctx = PipelineContext { paths, config };
    let target = std::path::absolute(&opts.target)?;
    let summary = pipeline::run(&ctx, &opts.source, &target, opts.mode)?;

    for warning in &summary.warnings {
        report.warn(warning.clone());
    }
    for outcome in &summary.archives {
        report.detail(format!(
            "archive={} status={} visits={} converted={} failed={} placed={}",
            outcome.archive.display(),
            outcome.status.as_str(),
            outcome.visits_total,
            outcome.visits_converted,
            outcome.visits_failed,
            outcome.files_placed
        ));
        for warning in &outcome.warnings {
            report.warn(warning.clone());
        }
        if outcome.status == ArchiveStatus::Failed {
            report.issue(format!(
                "archive {} not recorded: {}",
                outcome.archive.display(),
                outcome.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    report.detail(format!(
        "summary processed={} already_processed={} failed={} files_placed={} visits_failed={}",
        summary.count(ArchiveStatus::Processed),
        summary.count(ArchiveStatus::AlreadyProcessed),
        summary.count(ArchiveStatus::Failed),
        summary.files_placed(),
        summary.visits_failed()
    ));

    Ok(report)
}
