use crate::bids::config::ConverterConfig;
use crate::bids::util::{CommandRunError, run_command_with_optional_timeout};
use crate::error::ConvertError;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const DEFAULT_CONVERTER: &str = "dcm2niix";
const STDERR_TAIL_CHARS: usize = 400;

/// External DICOM-to-NIfTI converter. Each call is a single blocking
/// attempt; retries come from re-running the archive.
#[derive(Debug, Clone)]
pub struct Converter {
    bin: PathBuf,
    timeout: Option<Duration>,
}

pub fn resolve_converter_bin(configured: Option<&str>) -> Result<PathBuf, ConvertError> {
    if let Some(bin) = configured.map(str::trim).filter(|b| !b.is_empty()) {
        let path = PathBuf::from(bin);
        if path.is_file() {
            return Ok(path);
        }
        return Err(ConvertError::Unavailable(format!(
            "configured converter does not exist: {}",
            path.display()
        )));
    }
    if let Ok(custom) = env::var("DCM2NIIX_BIN") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            if path.is_file() {
                return Ok(path);
            }
            return Err(ConvertError::Unavailable(format!(
                "DCM2NIIX_BIN does not exist: {}",
                path.display()
            )));
        }
    }
    which::which(DEFAULT_CONVERTER).map_err(|_| {
        ConvertError::Unavailable(
            "dcm2niix not found; set DCM2NIIX_BIN or converter.bin".to_string(),
        )
    })
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

impl Converter {
    pub fn new(bin: PathBuf, timeout_secs: u64) -> Self {
        Self {
            bin,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }

    pub fn from_config(cfg: &ConverterConfig) -> Result<Self, ConvertError> {
        let bin = resolve_converter_bin(cfg.bin.as_deref())?;
        Ok(Self::new(bin, cfg.timeout_secs))
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    /// Converts the DICOM series in `visit_dir` in place: gzip-compressed
    /// NIfTI volumes plus JSON sidecars are written next to the input.
    pub fn convert(&self, visit_dir: &Path) -> Result<(), ConvertError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-z")
            .arg("y")
            .arg("-b")
            .arg("y")
            .arg("-o")
            .arg(visit_dir)
            .arg(visit_dir);

        let output = match run_command_with_optional_timeout(&mut cmd, self.timeout) {
            Ok(output) => output,
            Err(CommandRunError::TimedOut(limit)) => {
                return Err(ConvertError::TimedOut {
                    secs: limit.as_secs(),
                });
            }
            Err(CommandRunError::Io(source)) => {
                return Err(ConvertError::Spawn {
                    path: self.bin.clone(),
                    source,
                });
            }
        };

        if output.status.success() {
            return Ok(());
        }
        Err(ConvertError::Failed {
            code: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr: stderr_tail(&output.stderr),
        })
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::fixtures::{FAKE_CONVERTER, write_script};
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn successful_run_writes_outputs_into_visit_dir() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("dcm2niix");
        write_script(&bin, FAKE_CONVERTER);
        let visit = tmp.path().join("20210105");
        fs::create_dir_all(&visit).expect("mkdir");

        Converter::new(bin, 30).convert(&visit).expect("convert");
        assert!(visit.join("scan_T1_MPRAGE_MS-P_2.nii.gz").is_file());
        assert!(visit.join("scan_3D_FLAIR_MS-P_3.json").is_file());
    }

    #[test]
    fn non_zero_exit_is_reported_with_stderr() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("dcm2niix");
        write_script(&bin, FAKE_CONVERTER);
        let visit = tmp.path().join("BADVISIT");
        fs::create_dir_all(&visit).expect("mkdir");

        let err = Converter::new(bin, 30).convert(&visit).expect_err("fails");
        match err {
            ConvertError::Failed { code, stderr } => {
                assert_eq!(code, "2");
                assert_eq!(stderr, "cannot read DICOM");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn hung_converter_times_out() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("dcm2niix");
        write_script(&bin, "#!/bin/sh\nsleep 5\n");
        let visit = tmp.path().join("20210105");
        fs::create_dir_all(&visit).expect("mkdir");

        let mut converter = Converter::new(bin, 1);
        converter.timeout = Some(Duration::from_millis(200));
        let err = converter.convert(&visit).expect_err("times out");
        assert!(matches!(err, ConvertError::TimedOut { .. }));
    }

    #[test]
    fn configured_bin_must_exist() {
        let err = resolve_converter_bin(Some("/nonexistent/dcm2niix")).expect_err("missing");
        assert!(matches!(err, ConvertError::Unavailable(_)));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL_CHARS) + "END";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.ends_with("END"));
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
    }
}
