use crate::error::WarnCode;

/// One categorized, operator-facing warning. Rendered as a single
/// `key=value` line so batch logs can be grepped by code or stage.
#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: WarnCode,
    pub stage: &'a str,
    pub action: &'a str,
    pub subject: &'a str,
    pub session: &'a str,
    pub archive: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

impl Default for WarnEvent<'_> {
    fn default() -> Self {
        Self {
            code: WarnCode::W001MalformedVisit,
            stage: "",
            action: "",
            subject: "",
            session: "",
            archive: "",
            reason: "",
            err: "",
        }
    }
}

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn render(event: &WarnEvent<'_>) -> String {
    format!(
        "MSP2BIDS_WARN code={} stage={} action={} subject={} session={} archive={} reason={} err={}",
        event.code.as_str(),
        sanitize_value(event.stage),
        sanitize_value(event.action),
        sanitize_value(event.subject),
        sanitize_value(event.session),
        sanitize_value(event.archive),
        sanitize_value(event.reason),
        sanitize_value(event.err),
    )
}

/// Logs the event at warn level and returns the rendered line so callers
/// can also attach it to their command report.
pub fn emit(event: WarnEvent<'_>) -> String {
    let line = render(&event);
    tracing::warn!("{line}");
    line
}
