use anyhow::Result;
use std::path::PathBuf;

use crate::bids::layout::known_subject_ids;
use crate::commands::CommandReport;

#[derive(Debug, Clone)]
pub struct SubjectsOptions {
    pub target: PathBuf,
}

pub fn run(opts: &SubjectsOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("subjects");
    let ids = known_subject_ids(&opts.target)?;
    report.detail(format!("count={}", ids.len()));
    for id in ids {
        report.detail(id);
    }
    Ok(report)
}
