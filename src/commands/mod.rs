pub mod cleanup;
pub mod extract;
pub mod status;
pub mod subjects;

use serde::Serialize;

use crate::bids::convert::resolve_converter_bin;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub warnings: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            warnings: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    /// Recorded for the operator; does not fail the command.
    pub fn warn(&mut self, text: impl Into<String>) {
        self.warnings.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

pub fn ensure_converter_available(configured: Option<&str>, report: &mut CommandReport) -> bool {
    match resolve_converter_bin(configured) {
        Ok(bin) => {
            report.detail(format!("converter={}", bin.display()));
            true
        }
        Err(err) => {
            report.issue(format!("{err}"));
            false
        }
    }
}
