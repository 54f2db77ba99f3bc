use crate::bids::audit;
use crate::bids::config::{BundleConfig, Msp2BidsConfig};
use crate::bids::convert::Converter;
use crate::bids::ledger::Ledger;
use crate::bids::paths::BidsPaths;
use crate::bids::placement::{PlacementOutcome, classify_and_place};
use crate::bids::unpack::{ScratchDir, UnpackOutcome, VisitDir, clear_stale_scratch, unpack};
use crate::bids::warn::{self, WarnEvent};
use crate::error::WarnCode;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub paths: BidsPaths,
    pub config: Msp2BidsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// `source` is a directory of bundle folders.
    Batch,
    /// `source` is one archive; `force` bypasses the ledger check.
    Single { force: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Processed,
    AlreadyProcessed,
    Failed,
}

impl ArchiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::AlreadyProcessed => "already-processed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub archive: PathBuf,
    pub status: ArchiveStatus,
    pub visits_total: usize,
    pub visits_converted: usize,
    pub visits_failed: usize,
    pub files_placed: usize,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl ArchiveOutcome {
    fn new(archive: &Path, status: ArchiveStatus) -> Self {
        Self {
            archive: archive.to_path_buf(),
            status,
            visits_total: 0,
            visits_converted: 0,
            visits_failed: 0,
            files_placed: 0,
            warnings: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub archives: Vec<ArchiveOutcome>,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn count(&self, status: ArchiveStatus) -> usize {
        self.archives.iter().filter(|a| a.status == status).count()
    }

    pub fn files_placed(&self) -> usize {
        self.archives.iter().map(|a| a.files_placed).sum()
    }

    pub fn visits_failed(&self) -> usize {
        self.archives.iter().map(|a| a.visits_failed).sum()
    }
}

pub fn discover_archives(source_dir: &Path, bundles: &BundleConfig) -> Result<Vec<PathBuf>> {
    let pattern = bundles.archive_regex()?;
    if !source_dir.is_dir() {
        anyhow::bail!("source dir does not exist: {}", source_dir.display());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(source_dir).min_depth(2).max_depth(2) {
        let entry =
            entry.with_context(|| format!("failed to scan {}", source_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let in_bundle_dir = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&bundles.dir_prefix));
        let name_matches = entry
            .file_name()
            .to_str()
            .is_some_and(|n| pattern.is_match(n));
        if in_bundle_dir && name_matches {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}

fn archive_label(archive: &Path) -> String {
    archive.display().to_string()
}

fn process_visit(
    converter: &Converter,
    visit: &VisitDir,
    target_root: &Path,
    archive: &str,
    out: &mut ArchiveOutcome,
) {
    if let Err(err) = converter.convert(&visit.path) {
        out.visits_failed += 1;
        out.warnings.push(warn::emit(WarnEvent {
            code: WarnCode::W002ConvertFailed,
            stage: "convert",
            action: "skip-visit",
            subject: &visit.subject,
            session: &visit.session,
            archive,
            reason: "converter-failed",
            err: &err.to_string(),
        }));
        return;
    }

    match classify_and_place(&visit.path, &visit.subject, &visit.session, target_root) {
        Ok(PlacementOutcome { placed, warnings }) => {
            out.files_placed += placed.len();
            out.warnings.extend(warnings);
            if placed.is_empty() {
                out.visits_failed += 1;
                out.warnings.push(warn::emit(WarnEvent {
                    code: WarnCode::W003MissingDerivative,
                    stage: "place",
                    action: "skip-visit",
                    subject: &visit.subject,
                    session: &visit.session,
                    archive,
                    reason: "no-T1w-or-FLAIR-output",
                    ..WarnEvent::default()
                }));
            } else {
                out.visits_converted += 1;
            }
        }
        Err(err) => {
            out.visits_failed += 1;
            out.warnings.push(warn::emit(WarnEvent {
                code: WarnCode::W003MissingDerivative,
                stage: "place",
                action: "skip-visit",
                subject: &visit.subject,
                session: &visit.session,
                archive,
                reason: "placement-failed",
                err: &format!("{err:#}"),
            }));
        }
    }
}

/// Visit-level problems are warnings; the archive is recorded whenever
/// extraction itself succeeded.
pub fn process_archive(
    ctx: &PipelineContext,
    converter: &Converter,
    ledger: &mut Ledger,
    archive: &Path,
    target_root: &Path,
) -> ArchiveOutcome {
    let label = archive_label(archive);
    let unpacked = ScratchDir::acquire(&ctx.paths.scratch_root).and_then(|scratch| {
        let listing = unpack(archive, scratch.path())?;
        Ok((scratch, listing))
    });
    let (scratch, UnpackOutcome { visits, malformed }) = match unpacked {
        Ok(v) => v,
        Err(err) => {
            let mut out = ArchiveOutcome::new(archive, ArchiveStatus::Failed);
            let err_text = format!("{err:#}");
            out.warnings.push(warn::emit(WarnEvent {
                code: WarnCode::W008ArchiveUnreadable,
                stage: "unpack",
                action: "skip-archive",
                archive: &label,
                reason: "extraction-failed-not-recorded",
                err: &err_text,
                ..WarnEvent::default()
            }));
            out.error = Some(err_text);
            audit::record(&ctx.paths, "archive", out.status.as_str(), &label);
            return out;
        }
    };
    tracing::info!(
        "extracted {} into {} ({} visits)",
        label,
        scratch.path().display(),
        visits.len()
    );

    let mut out = ArchiveOutcome::new(archive, ArchiveStatus::Processed);
    out.visits_total = visits.len() + malformed.len();
    for bad in &malformed {
        out.visits_failed += 1;
        out.warnings.push(warn::emit(WarnEvent {
            code: WarnCode::W001MalformedVisit,
            stage: "unpack",
            action: "skip-visit",
            archive: &label,
            reason: &bad.reason,
            err: &bad.path.display().to_string(),
            ..WarnEvent::default()
        }));
    }

    for (idx, visit) in visits.iter().enumerate() {
        tracing::info!(
            "[{}/{}] converting subject {}, session {}",
            idx + 1,
            visits.len(),
            visit.subject,
            visit.session
        );
        process_visit(converter, visit, target_root, &label, &mut out);
    }

    if let Err(err) = ledger.mark_processed(archive) {
        out.status = ArchiveStatus::Failed;
        out.error = Some(format!("ledger append failed: {err:#}"));
    } else if !out.warnings.is_empty() {
        tracing::warn!(
            "{} recorded as processed with {} visit-level warning(s); those visits will not be retried automatically",
            label,
            out.warnings.len()
        );
    }

    audit::record(
        &ctx.paths,
        "archive",
        out.status.as_str(),
        &format!(
            "{label} visits={} converted={} failed={} placed={}",
            out.visits_total, out.visits_converted, out.visits_failed, out.files_placed
        ),
    );
    out
}

/// The caller holds the run lock, so scratch dirs found at start are stale.
pub fn run(
    ctx: &PipelineContext,
    source: &Path,
    target_root: &Path,
    mode: RunMode,
) -> Result<RunSummary> {
    let converter = Converter::from_config(&ctx.config.converter)?;
    tracing::debug!("using converter {}", converter.bin().display());
    let swept = clear_stale_scratch(&ctx.paths.scratch_root)?;
    if swept > 0 {
        tracing::info!(
            "removed {swept} stale scratch dir(s) from {}",
            ctx.paths.scratch_root.display()
        );
    }
    let mut ledger = Ledger::load(&ctx.paths.ledger_file);
    tracing::debug!(
        "ledger {} lists {} archive(s)",
        ledger.path().display(),
        ledger.len()
    );

    let (archives, honor_ledger) = match mode {
        RunMode::Batch => (discover_archives(source, &ctx.config.bundles)?, true),
        RunMode::Single { force } => (vec![source.to_path_buf()], !force),
    };

    let mut summary = RunSummary::default();
    if archives.is_empty() {
        summary.warnings.push(format!(
            "no bundle archive found in {}",
            source.display()
        ));
        tracing::warn!("could not find any bundle archive in {}", source.display());
        return Ok(summary);
    }
    tracing::debug!("found {} bundle archive(s)", archives.len());

    for (idx, archive) in archives.iter().enumerate() {
        tracing::info!(
            "[{}/{}] archive {}",
            idx + 1,
            archives.len(),
            archive.display()
        );
        if honor_ledger && ledger.is_processed(archive) {
            tracing::info!("already processed {}; skipping", archive.display());
            summary
                .archives
                .push(ArchiveOutcome::new(archive, ArchiveStatus::AlreadyProcessed));
            continue;
        }
        let outcome = process_archive(ctx, &converter, &mut ledger, archive, target_root);
        summary.archives.push(outcome);
    }

    Ok(summary)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bids::convert::fixtures::{FAKE_CONVERTER, write_script};
    use crate::bids::unpack::fixtures::write_zip;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        tmp: TempDir,
        ctx: PipelineContext,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_converter(FAKE_CONVERTER, 30)
        }

        fn with_converter(script: &str, timeout_secs: u64) -> Self {
            let tmp = tempdir().expect("tempdir");
            let bin = tmp.path().join("dcm2niix");
            write_script(&bin, script);
            let mut config = Msp2BidsConfig::default();
            config.converter.bin = Some(bin.display().to_string());
            config.converter.timeout_secs = timeout_secs;
            let paths =
                BidsPaths::rooted_at(tmp.path().join("state"), tmp.path().join("scratch"));
            Self {
                tmp,
                ctx: PipelineContext { paths, config },
            }
        }

        fn source(&self) -> PathBuf {
            self.tmp.path().join("source")
        }

        fn target(&self) -> PathBuf {
            self.tmp.path().join("bids")
        }

        fn bundle(&self, dir: &str, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
            let folder = self.source().join(dir);
            fs::create_dir_all(&folder).expect("mkdir");
            let path = folder.join(name);
            write_zip(&path, files);
            path
        }

        fn target_files(&self) -> Vec<String> {
            let root = self.target();
            let mut out = WalkDir::new(&root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| {
                    e.path()
                        .strip_prefix(&root)
                        .expect("prefix")
                        .display()
                        .to_string()
                })
                .collect::<Vec<_>>();
            out.sort();
            out
        }
    }

    #[test]
    fn discovery_requires_bundle_dir_and_name_pattern() {
        let h = Harness::new();
        let a = h.bundle("MRI_2021", "MSPATHS_X_DICOM_1.zip", &[("a/b/c", b"x")]);
        h.bundle("MRI_2021", "notes.zip", &[("a/b/c", b"x")]);
        h.bundle("TABLES", "MSPATHS_X_DICOM_2.zip", &[("a/b/c", b"x")]);

        let found = discover_archives(&h.source(), &h.ctx.config.bundles).expect("discover");
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn partial_failure_is_contained_and_archive_is_recorded() {
        let h = Harness::new();
        let archive = h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_1.zip",
            &[
                ("MSPATHS_1001/20210105/IM1.dcm", b"d"),
                ("MSPATHS_1002/20210301/IM1.dcm", b"d"),
                ("NOSUBJECT/20210101/IM1.dcm", b"d"),
            ],
        );

        let summary = run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("run");
        assert_eq!(summary.count(ArchiveStatus::Processed), 1);
        let outcome = &summary.archives[0];
        assert_eq!(outcome.visits_total, 3);
        assert_eq!(outcome.visits_converted, 2);
        assert_eq!(outcome.files_placed, 8);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("W001_MALFORMED_VISIT"));
        assert!(Ledger::load(&h.ctx.paths.ledger_file).is_processed(&archive));
        assert!(h.target().join("sub-1001/ses-20210105/anat").is_dir());
        assert!(h.target().join("sub-1002/ses-20210301/anat").is_dir());
    }

    #[test]
    fn converter_failure_skips_visit_but_records_archive() {
        let h = Harness::new();
        let archive = h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_1.zip",
            &[
                ("MSPATHS_1001/20210105/IM1.dcm", b"d"),
                ("MSPATHS_BADVISIT/20210301/IM1.dcm", b"d"),
            ],
        );

        let summary = run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("run");
        let outcome = &summary.archives[0];
        assert_eq!(outcome.status, ArchiveStatus::Processed);
        assert_eq!(outcome.visits_failed, 1);
        assert!(outcome.warnings[0].contains("W002_CONVERT_FAILED"));
        assert!(Ledger::load(&h.ctx.paths.ledger_file).is_processed(&archive));
        assert!(!h.target().join("sub-BADVISIT").exists());
    }

    #[test]
    fn corrupt_archive_is_not_recorded_and_batch_continues() {
        let h = Harness::new();
        let folder = h.source().join("MRI_1");
        fs::create_dir_all(&folder).expect("mkdir");
        let broken = folder.join("MSPATHS_1_DICOM_1.zip");
        fs::write(&broken, b"truncated").expect("write");
        let good = h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_2.zip",
            &[("MSPATHS_1001/20210105/IM1.dcm", b"d")],
        );

        let summary = run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("run");
        assert_eq!(summary.count(ArchiveStatus::Failed), 1);
        assert_eq!(summary.count(ArchiveStatus::Processed), 1);
        let ledger = Ledger::load(&h.ctx.paths.ledger_file);
        assert!(!ledger.is_processed(&broken));
        assert!(ledger.is_processed(&good));
    }

    #[test]
    fn second_run_skips_everything_and_changes_nothing() {
        let h = Harness::new();
        h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_1.zip",
            &[("MSPATHS_1001/20210105/IM1.dcm", b"d")],
        );

        run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("first");
        let files_after_first = h.target_files();
        let ledger_after_first = fs::read_to_string(&h.ctx.paths.ledger_file).expect("ledger");

        let summary = run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("second");
        assert_eq!(summary.count(ArchiveStatus::AlreadyProcessed), 1);
        assert_eq!(summary.files_placed(), 0);
        assert_eq!(h.target_files(), files_after_first);
        assert_eq!(
            fs::read_to_string(&h.ctx.paths.ledger_file).expect("ledger"),
            ledger_after_first
        );
    }

    #[test]
    fn single_mode_can_force_a_recorded_archive() {
        let h = Harness::new();
        let archive = h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_1.zip",
            &[("MSPATHS_1001/20210105/IM1.dcm", b"d")],
        );

        run(&h.ctx, &archive, &h.target(), RunMode::Single { force: false }).expect("first");
        let skipped =
            run(&h.ctx, &archive, &h.target(), RunMode::Single { force: false }).expect("skip");
        assert_eq!(skipped.count(ArchiveStatus::AlreadyProcessed), 1);

        let forced =
            run(&h.ctx, &archive, &h.target(), RunMode::Single { force: true }).expect("force");
        assert_eq!(forced.count(ArchiveStatus::Processed), 1);
        assert_eq!(forced.files_placed(), 4);
        let ledger = fs::read_to_string(&h.ctx.paths.ledger_file).expect("ledger");
        assert_eq!(ledger.lines().count(), 1);
    }

    #[test]
    fn scratch_space_is_released_after_each_archive() {
        let h = Harness::new();
        h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_1.zip",
            &[("MSPATHS_1001/20210105/IM1.dcm", b"d")],
        );

        run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("run");
        let leftovers = fs::read_dir(&h.ctx.paths.scratch_root)
            .expect("scratch root")
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn residue_from_a_killed_run_is_swept_before_processing() {
        let h = Harness::new();
        let crashed = h.ctx.paths.scratch_root.join("bundle-crashed/MSPATHS_9999/20190101");
        fs::create_dir_all(&crashed).expect("mkdir");
        fs::write(crashed.join("IM1.dcm"), b"d").expect("write");
        h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_1.zip",
            &[("MSPATHS_1001/20210105/IM1.dcm", b"d")],
        );

        let summary = run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("run");
        assert_eq!(summary.count(ArchiveStatus::Processed), 1);
        let leftovers = fs::read_dir(&h.ctx.paths.scratch_root)
            .expect("scratch root")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert!(leftovers.is_empty(), "scratch residue left: {leftovers:?}");
        assert!(!h.target().join("sub-9999").exists());
    }

    #[test]
    fn converter_without_usable_output_is_a_missing_derivative() {
        let h = Harness::with_converter("#!/bin/sh\nexit 0\n", 30);
        let archive = h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_1.zip",
            &[("MSPATHS_1001/20210105/IM1.dcm", b"d")],
        );

        let summary = run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("run");
        let outcome = &summary.archives[0];
        assert_eq!(outcome.status, ArchiveStatus::Processed);
        assert_eq!(outcome.visits_converted, 0);
        assert_eq!(outcome.visits_failed, 1);
        assert_eq!(outcome.files_placed, 0);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("W003_MISSING_DERIVATIVE"));
        assert!(Ledger::load(&h.ctx.paths.ledger_file).is_processed(&archive));
        assert!(!h.target().join("sub-1001").exists());
    }

    #[test]
    fn hung_converter_fails_only_its_visit() {
        let h = Harness::with_converter("#!/bin/sh\nsleep 10\n", 1);
        let archive = h.bundle(
            "MRI_1",
            "MSPATHS_1_DICOM_1.zip",
            &[("MSPATHS_1001/20210105/IM1.dcm", b"d")],
        );

        let started = std::time::Instant::now();
        let summary = run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("run");
        assert!(started.elapsed() < std::time::Duration::from_secs(8));
        let outcome = &summary.archives[0];
        assert_eq!(outcome.status, ArchiveStatus::Processed);
        assert_eq!(outcome.visits_failed, 1);
        assert!(outcome.warnings[0].contains("W002_CONVERT_FAILED"));
        assert!(outcome.warnings[0].contains("timed_out"));
        assert!(Ledger::load(&h.ctx.paths.ledger_file).is_processed(&archive));
    }

    #[test]
    fn empty_source_is_a_warning_not_an_error() {
        let h = Harness::new();
        fs::create_dir_all(h.source()).expect("mkdir");
        let summary = run(&h.ctx, &h.source(), &h.target(), RunMode::Batch).expect("run");
        assert!(summary.archives.is_empty());
        assert_eq!(summary.warnings.len(), 1);
    }
}
