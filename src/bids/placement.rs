use crate::bids::layout::{anat_dir, derivative_file_name};
use crate::bids::warn::{self, WarnEvent};
use crate::error::WarnCode;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const IMAGE_EXT: &str = "nii.gz";
const SIDECAR_EXT: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Modality {
    Flair,
    T1w,
}

static FLAIR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FLAIR.*MS-P.*\.nii\.gz$").expect("valid FLAIR pattern"));
static T1W_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"T1.*MS-P.*\.nii\.gz$").expect("valid T1w pattern"));

impl Modality {
    /// Classification order. The first matching pattern wins.
    pub const ORDERED: [Modality; 2] = [Modality::Flair, Modality::T1w];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Flair => "FLAIR",
            Self::T1w => "T1w",
        }
    }

    fn pattern(self) -> &'static Regex {
        match self {
            Self::Flair => &FLAIR_PATTERN,
            Self::T1w => &T1W_PATTERN,
        }
    }
}

pub fn classify(file_name: &str) -> Option<Modality> {
    Modality::ORDERED
        .into_iter()
        .find(|m| m.pattern().is_match(file_name))
}

/// `x.nii.gz` -> `x.json`
pub fn sidecar_path(image: &Path) -> Option<PathBuf> {
    let name = image.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{IMAGE_EXT}"))?;
    Some(image.with_file_name(format!("{stem}.{SIDECAR_EXT}")))
}

#[derive(Debug, Clone, Default)]
pub struct PlacementOutcome {
    pub placed: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

fn copy_into(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    Ok(())
}

/// Copies classified converter output from `visit_dir` into
/// `<target_root>/sub-<subject>/ses-<session>/anat/`. Unclassified files
/// are ignored; a missing sidecar is a warning, never an error. The visit
/// directory is left untouched.
pub fn classify_and_place(
    visit_dir: &Path,
    subject: &str,
    session: &str,
    target_root: &Path,
) -> Result<PlacementOutcome> {
    let mut names = fs::read_dir(visit_dir)
        .with_context(|| format!("failed to read {}", visit_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    names.sort();

    let mut out = PlacementOutcome::default();
    let mut chosen: BTreeMap<Modality, PathBuf> = BTreeMap::new();
    for name in names {
        let Some(modality) = classify(&name) else {
            continue;
        };
        let source = visit_dir.join(&name);
        if let Some(first) = chosen.get(&modality) {
            out.warnings.push(warn::emit(WarnEvent {
                code: WarnCode::W005DuplicateModality,
                stage: "place",
                action: "skip-duplicate",
                subject,
                session,
                reason: &format!(
                    "{} already placed from {}",
                    modality.suffix(),
                    first.display()
                ),
                err: &name,
                ..WarnEvent::default()
            }));
            continue;
        }
        chosen.insert(modality, source);
    }

    if chosen.is_empty() {
        return Ok(out);
    }

    let target_dir = anat_dir(target_root, subject, session);
    fs::create_dir_all(&target_dir)
        .with_context(|| format!("failed to create {}", target_dir.display()))?;

    for (modality, image) in chosen {
        let image_target =
            target_dir.join(derivative_file_name(subject, session, modality.suffix(), IMAGE_EXT));
        copy_into(&image, &image_target)?;
        out.placed.push(image_target);

        let sidecar = sidecar_path(&image).filter(|p| p.is_file());
        match sidecar {
            Some(sidecar) => {
                let sidecar_target = target_dir.join(derivative_file_name(
                    subject,
                    session,
                    modality.suffix(),
                    SIDECAR_EXT,
                ));
                copy_into(&sidecar, &sidecar_target)?;
                out.placed.push(sidecar_target);
            }
            None => {
                out.warnings.push(warn::emit(WarnEvent {
                    code: WarnCode::W004MissingSidecar,
                    stage: "place",
                    action: "place-without-sidecar",
                    subject,
                    session,
                    reason: "sidecar-missing",
                    err: &image.display().to_string(),
                    ..WarnEvent::default()
                }));
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use walkdir::WalkDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), name.as_bytes()).expect("write");
    }

    fn files_under(root: &Path) -> Vec<PathBuf> {
        let mut out = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().strip_prefix(root).expect("prefix").to_path_buf())
            .collect::<Vec<_>>();
        out.sort();
        out
    }

    #[test]
    fn classification_is_ordered_and_closed() {
        assert_eq!(classify("x_3D_FLAIR_MS-P_3.nii.gz"), Some(Modality::Flair));
        assert_eq!(classify("x_T1_MPRAGE_MS-P_2.nii.gz"), Some(Modality::T1w));
        // FLAIR wins when both tokens appear.
        assert_eq!(classify("T1_FLAIR_MS-P.nii.gz"), Some(Modality::Flair));
        assert_eq!(classify("x_T1_MPRAGE_MS-P_2.json"), None);
        assert_eq!(classify("x_T2_MS-P_4.nii.gz"), None);
        assert_eq!(classify("x_T1_MPRAGE_2.nii.gz"), None);
    }

    #[test]
    fn sidecar_shares_stem() {
        assert_eq!(
            sidecar_path(Path::new("/v/a_T1_MS-P.nii.gz")),
            Some(PathBuf::from("/v/a_T1_MS-P.json"))
        );
        assert_eq!(sidecar_path(Path::new("/v/a.nii")), None);
    }

    #[test]
    fn places_images_and_sidecars_only_under_anat() {
        let tmp = tempdir().expect("tempdir");
        let visit = tmp.path().join("scratch/MSPATHS_1001/20210105");
        fs::create_dir_all(&visit).expect("mkdir");
        for name in [
            "s_T1_MPRAGE_MS-P_2.nii.gz",
            "s_T1_MPRAGE_MS-P_2.json",
            "s_3D_FLAIR_MS-P_3.nii.gz",
            "s_3D_FLAIR_MS-P_3.json",
            "s_localizer_1.nii.gz",
            "IM0001.dcm",
        ] {
            touch(&visit, name);
        }
        let target = tmp.path().join("bids");

        let out = classify_and_place(&visit, "1001", "20210105", &target).expect("place");
        assert_eq!(out.placed.len(), 4);
        assert!(out.warnings.is_empty());
        assert_eq!(
            files_under(&target),
            vec![
                PathBuf::from("sub-1001/ses-20210105/anat/sub-1001_ses-20210105_FLAIR.json"),
                PathBuf::from("sub-1001/ses-20210105/anat/sub-1001_ses-20210105_FLAIR.nii.gz"),
                PathBuf::from("sub-1001/ses-20210105/anat/sub-1001_ses-20210105_T1w.json"),
                PathBuf::from("sub-1001/ses-20210105/anat/sub-1001_ses-20210105_T1w.nii.gz"),
            ]
        );
        // Copy, not move.
        assert!(visit.join("s_T1_MPRAGE_MS-P_2.nii.gz").is_file());
    }

    #[test]
    fn missing_sidecar_places_image_and_warns() {
        let tmp = tempdir().expect("tempdir");
        let visit = tmp.path().join("visit");
        fs::create_dir_all(&visit).expect("mkdir");
        touch(&visit, "s_T1_MPRAGE_MS-P_2.nii.gz");
        let target = tmp.path().join("bids");

        let out = classify_and_place(&visit, "1001", "20210105", &target).expect("place");
        assert_eq!(out.placed.len(), 1);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("W004_MISSING_SIDECAR"));
    }

    #[test]
    fn duplicate_modality_keeps_first_and_warns() {
        let tmp = tempdir().expect("tempdir");
        let visit = tmp.path().join("visit");
        fs::create_dir_all(&visit).expect("mkdir");
        touch(&visit, "a_T1_MS-P_2.nii.gz");
        touch(&visit, "a_T1_MS-P_2.json");
        touch(&visit, "b_T1_MS-P_5.nii.gz");
        touch(&visit, "b_T1_MS-P_5.json");
        let target = tmp.path().join("bids");

        let out = classify_and_place(&visit, "1001", "20210105", &target).expect("place");
        assert_eq!(out.placed.len(), 2);
        assert_eq!(out.warnings.len(), 1);
        let placed = fs::read_to_string(
            anat_dir(&target, "1001", "20210105").join("sub-1001_ses-20210105_T1w.nii.gz"),
        )
        .expect("read");
        assert_eq!(placed, "a_T1_MS-P_2.nii.gz");
    }

    #[test]
    fn nothing_classified_creates_no_directories() {
        let tmp = tempdir().expect("tempdir");
        let visit = tmp.path().join("visit");
        fs::create_dir_all(&visit).expect("mkdir");
        touch(&visit, "s_localizer_1.nii.gz");
        let target = tmp.path().join("bids");

        let out = classify_and_place(&visit, "1001", "20210105", &target).expect("place");
        assert_eq!(out.placed.len(), 0);
        assert!(!target.exists());
    }
}
