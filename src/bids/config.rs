use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Explicit converter path. When unset, `DCM2NIIX_BIN` and then `PATH`
    /// are searched.
    pub bin: Option<String>,
    /// Per-visit wall clock limit. 0 disables the limit.
    pub timeout_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            bin: None,
            timeout_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub dir_prefix: String,
    pub archive_pattern: String,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            dir_prefix: "MRI".to_string(),
            archive_pattern: r"^MSPATHS.*_DICOM_.*\.zip$".to_string(),
        }
    }
}

impl BundleConfig {
    pub fn archive_regex(&self) -> Result<Regex> {
        Regex::new(&self.archive_pattern)
            .map_err(|err| anyhow!("invalid bundle archive pattern: {err}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_ordinal: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_ordinal: 999 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Msp2BidsConfig {
    pub converter: ConverterConfig,
    pub bundles: BundleConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialConfig {
    converter: Option<ConverterConfig>,
    bundles: Option<BundleConfig>,
    sessions: Option<SessionConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_optional_string(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

fn validate(cfg: &Msp2BidsConfig) -> Result<()> {
    if cfg.bundles.dir_prefix.contains(['/', '\\']) {
        return Err(anyhow!(
            "invalid bundle dir prefix: must be a single path component"
        ));
    }
    cfg.bundles.archive_regex()?;
    // Session ids are rendered with three digits.
    if cfg.sessions.max_ordinal == 0 || cfg.sessions.max_ordinal > 999 {
        return Err(anyhow!(
            "invalid session max ordinal: require 1 <= max_ordinal <= 999"
        ));
    }
    if let Some(bin) = &cfg.converter.bin {
        if bin.trim().is_empty() {
            return Err(anyhow!("invalid converter bin: cannot be empty"));
        }
    }
    Ok(())
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("MSP2BIDS_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".mspaths2bids").join("config.toml"))
}

fn merge_file_config(base: &mut Msp2BidsConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse config {}: {err}", path.display()))?;
    if let Some(converter) = parsed.converter {
        base.converter = converter;
    }
    if let Some(bundles) = parsed.bundles {
        base.bundles = bundles;
    }
    if let Some(sessions) = parsed.sessions {
        base.sessions = sessions;
    }
    Ok(())
}

pub fn load_config() -> Result<Msp2BidsConfig> {
    let mut cfg = Msp2BidsConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.converter.bin = env_or_optional_string("MSP2BIDS_CONVERTER_BIN", cfg.converter.bin);
    cfg.converter.timeout_secs =
        env_or_u64("MSP2BIDS_CONVERTER_TIMEOUT_SECS", cfg.converter.timeout_secs);
    cfg.bundles.dir_prefix = env_or_string("MSP2BIDS_BUNDLE_DIR_PREFIX", &cfg.bundles.dir_prefix);
    cfg.bundles.archive_pattern =
        env_or_string("MSP2BIDS_ARCHIVE_PATTERN", &cfg.bundles.archive_pattern);
    cfg.sessions.max_ordinal =
        env_or_u32("MSP2BIDS_SESSION_MAX_ORDINAL", cfg.sessions.max_ordinal);

    validate(&cfg)?;
    Ok(cfg)
}
