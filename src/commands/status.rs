use anyhow::Result;

use crate::bids::config::{load_config, resolve_config_path};
use crate::bids::ledger::Ledger;
use crate::bids::paths::resolve_paths;
use crate::commands::{CommandReport, ensure_converter_available};

include!(concat!(env!("OUT_DIR"), "/env_allowlist.rs"));

const ENV_PREFIX: &str = "MSP2BIDS_";

fn unknown_env_keys<I>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut unknown: Vec<String> = keys
        .into_iter()
        .filter(|k| k.starts_with(ENV_PREFIX))
        .filter(|k| !GENERATED_ENV_ALLOWLIST.contains(&k.as_str()))
        .collect();
    unknown.sort();
    unknown
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("state_dir={}", paths.state_dir.display()));
    report.detail(format!("ledger_file={}", paths.ledger_file.display()));
    report.detail(format!("scratch_root={}", paths.scratch_root.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));

    match resolve_config_path() {
        Some(path) if path.exists() => report.detail(format!("config={}", path.display())),
        Some(path) => report.detail(format!("config={} (absent, defaults)", path.display())),
        None => report.detail("config=defaults"),
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            report.issue(format!("invalid config: {err:#}"));
            return Ok(report);
        }
    };
    report.detail(format!("bundle_dir_prefix={}", config.bundles.dir_prefix));
    report.detail(format!("archive_pattern={}", config.bundles.archive_pattern));
    report.detail(format!(
        "converter_timeout_secs={}",
        config.converter.timeout_secs
    ));
    report.detail(format!("session_max_ordinal={}", config.sessions.max_ordinal));

    ensure_converter_available(config.converter.bin.as_deref(), &mut report);

    if paths.ledger_file.exists() {
        let ledger = Ledger::load(&paths.ledger_file);
        report.detail(format!("ledger_entries={}", ledger.len()));
    } else {
        report.detail("ledger_entries=0 (no ledger yet)");
    }

    for key in unknown_env_keys(std::env::vars().map(|(k, _)| k)) {
        report.warn(format!("unknown env key {key} (typo?)"));
    }

    Ok(report)
}
