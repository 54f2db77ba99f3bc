use crate::bids::layout::{SESSION_PREFIX, sessions_tsv_path, subject_id_from_dir_name};
use crate::error::RegistryError;
use chrono::NaiveDate;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const SESSION_ID_COLUMN: &str = "session_id";
const ACQ_TIME_COLUMN: &str = "acq_time";
const MISSING_VALUE: &str = "n/a";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u32);

impl SessionId {
    pub fn new(ordinal: u32) -> Option<Self> {
        (1..=999).contains(&ordinal).then_some(Self(ordinal))
    }

    #[cfg(test)]
    pub fn ordinal(self) -> u32 {
        self.0
    }

    pub fn label(self) -> String {
        format!("{:03}", self.0)
    }

    /// Parses a reconciled label (`001`); exactly three digits.
    pub fn from_label(label: &str) -> Option<Self> {
        if label.len() != 3 || !label.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        label.parse::<u32>().ok().and_then(Self::new)
    }

    pub fn parse(value: &str) -> Option<Self> {
        value.strip_prefix(SESSION_PREFIX).and_then(Self::from_label)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SESSION_PREFIX}{}", self.label())
    }
}

/// Date plus an optional suffix for several visits on one day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VisitStamp {
    pub date: NaiveDate,
    pub suffix: String,
}

impl VisitStamp {
    #[cfg(test)]
    pub fn on(date: NaiveDate) -> Self {
        Self {
            date,
            suffix: String::new(),
        }
    }

    /// Parses a raw visit token: `YYYYMMDD` optionally followed by
    /// alphanumerics (`20210105`, `20210105b`).
    pub fn parse_raw(token: &str) -> Option<Self> {
        let digits = token.get(..8)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let suffix = &token[8..];
        if !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        let date = NaiveDate::parse_from_str(digits, "%Y%m%d").ok()?;
        Some(Self {
            date,
            suffix: suffix.to_string(),
        })
    }

    /// Inverse of `parse_raw`: `20210105b`.
    pub fn raw_label(&self) -> String {
        format!("{}{}", self.date.format("%Y%m%d"), self.suffix)
    }

    /// Parses the registry form: `2021-01-05` or `2021-01-05_b`.
    pub fn parse_acq_time(value: &str) -> Option<Self> {
        let (date_part, suffix) = match value.split_once('_') {
            Some((d, s)) if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()) => {
                (d, s)
            }
            Some(_) => return None,
            None => (value, ""),
        };
        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
        Some(Self {
            date,
            suffix: suffix.to_string(),
        })
    }

    pub fn acq_time(&self) -> String {
        let date = self.date.format("%Y-%m-%d");
        if self.suffix.is_empty() {
            date.to_string()
        } else {
            format!("{date}_{}", self.suffix)
        }
    }
}

impl fmt::Display for VisitStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.acq_time())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub acq_time: VisitStamp,
    extra: Vec<String>,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, acq_time: VisitStamp) -> Self {
        Self {
            session_id,
            acq_time,
            extra: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRegistry {
    records: Vec<SessionRecord>,
    extra_columns: Vec<String>,
}

impl SessionRegistry {
    #[cfg(test)]
    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stamp_of(&self, id: SessionId) -> Option<&VisitStamp> {
        self.records
            .iter()
            .find(|r| r.session_id == id)
            .map(|r| &r.acq_time)
    }

    pub fn id_of(&self, stamp: &VisitStamp) -> Option<SessionId> {
        self.records
            .iter()
            .find(|r| &r.acq_time == stamp)
            .map(|r| r.session_id)
    }

    pub fn insert(&mut self, mut record: SessionRecord) -> Result<(), RegistryError> {
        if self.stamp_of(record.session_id).is_some() || self.id_of(&record.acq_time).is_some() {
            return Err(RegistryError::Duplicate {
                session_id: record.session_id.to_string(),
                acq_time: record.acq_time.acq_time(),
            });
        }
        record
            .extra
            .resize(self.extra_columns.len(), MISSING_VALUE.to_string());
        self.records.push(record);
        Ok(())
    }

    fn render(&self) -> String {
        let mut header = vec![SESSION_ID_COLUMN.to_string(), ACQ_TIME_COLUMN.to_string()];
        header.extend(self.extra_columns.iter().cloned());
        let mut out = header.join("\t");
        out.push('\n');
        for record in &self.records {
            let mut row = vec![record.session_id.to_string(), record.acq_time.acq_time()];
            row.extend(record.extra.iter().cloned());
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }

    fn parse(path: &Path, raw: &str) -> Result<Self, RegistryError> {
        let corrupt = |line: usize, reason: String| RegistryError::Corrupt {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut lines = raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let Some((_, header)) = lines.next() else {
            return Ok(Self::default());
        };
        let columns = header.split('\t').map(str::trim).collect::<Vec<_>>();
        if columns.len() < 2 || columns[0] != SESSION_ID_COLUMN || columns[1] != ACQ_TIME_COLUMN {
            return Err(corrupt(
                1,
                format!("header must start with `{SESSION_ID_COLUMN}\\t{ACQ_TIME_COLUMN}`"),
            ));
        }

        let mut registry = Self {
            records: Vec::new(),
            extra_columns: columns[2..].iter().map(|c| c.to_string()).collect(),
        };
        for (idx, line) in lines {
            let line_no = idx + 1;
            let mut fields = line.split('\t').map(str::trim);
            let id_raw = fields.next().unwrap_or_default();
            let session_id = SessionId::parse(id_raw)
                .ok_or_else(|| corrupt(line_no, format!("invalid session id `{id_raw}`")))?;
            let acq_raw = fields.next().unwrap_or_default();
            let acq_time = VisitStamp::parse_acq_time(acq_raw)
                .ok_or_else(|| corrupt(line_no, format!("invalid acq_time `{acq_raw}`")))?;
            let record = SessionRecord {
                session_id,
                acq_time,
                extra: fields.map(ToOwned::to_owned).collect(),
            };
            registry
                .insert(record)
                .map_err(|err| corrupt(line_no, err.to_string()))?;
        }
        Ok(registry)
    }
}

pub fn registry_path(subject_dir: &Path) -> PathBuf {
    let name = subject_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let subject = subject_id_from_dir_name(&name).unwrap_or(&name);
    sessions_tsv_path(subject_dir, subject)
}

pub fn load(subject_dir: &Path) -> Result<SessionRegistry, RegistryError> {
    let path = registry_path(subject_dir);
    if !path.exists() {
        return Ok(SessionRegistry::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| RegistryError::Unreadable {
        path: path.clone(),
        source,
    })?;
    SessionRegistry::parse(&path, &raw)
}

/// Write-new-then-rename; never edits the file in place.
pub fn save(subject_dir: &Path, registry: &SessionRegistry) -> anyhow::Result<PathBuf> {
    use anyhow::Context;

    let path = registry_path(subject_dir);
    fs::create_dir_all(subject_dir)
        .with_context(|| format!("failed to create {}", subject_dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(subject_dir)
        .with_context(|| format!("failed to create temp file in {}", subject_dir.display()))?;
    tmp.write_all(registry.render().as_bytes())
        .with_context(|| format!("failed to write registry for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync registry for {}", path.display()))?;
    tmp.persist(&path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(path)
}
