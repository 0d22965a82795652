//! Split-file manifests: resolution by naming convention and loading.
//!
//! A manifest is a plain text file with one relative image path per line.
//! Split files are located by a `<prefix>*.txt` pattern built from the
//! configuration filters; a pattern must match exactly one file.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{CohortError, CohortResult};

/// Demographic subgroup encoded in CheXpert manifest names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sex {
    Male,
    Female,
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Male => write!(f, "male"),
            Self::Female => write!(f, "female"),
        }
    }
}

/// Ordered, immutable list of image paths for one (subgroup, condition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Split file the paths were read from.
    pub source: PathBuf,
    paths: Vec<PathBuf>,
}

impl Manifest {
    /// Build a manifest from already-resolved paths.
    pub fn new(source: impl Into<PathBuf>, paths: Vec<PathBuf>) -> Self {
        Self {
            source: source.into(),
            paths,
        }
    }

    /// Read a split file, joining every non-blank line onto `base_dir`.
    pub fn load(file: &Path, base_dir: &Path) -> CohortResult<Self> {
        let contents = std::fs::read_to_string(file)?;
        let paths: Vec<PathBuf> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| base_dir.join(l))
            .collect();
        tracing::debug!(file = %file.display(), count = paths.len(), "Loaded manifest");
        Ok(Self::new(file, paths))
    }

    /// Paths in file order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Display name used in error messages.
    pub fn name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.display().to_string())
    }
}

/// Find the single `*.txt` file in `dir` whose name starts with `prefix`.
///
/// # Errors
/// [`CohortError::ManifestNotFound`] when zero or several files match, or when
/// `dir` cannot be listed.
pub fn resolve_unique(dir: &Path, prefix: &str) -> CohortResult<PathBuf> {
    let pattern = format!("{}/{prefix}*.txt", dir.display());
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            return Err(CohortError::ManifestNotFound {
                pattern,
                matches: Vec::new(),
            })
        }
    };

    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix) && n.ends_with(".txt"))
                .unwrap_or(false)
        })
        .collect();
    matches.sort();

    if matches.len() != 1 {
        return Err(CohortError::ManifestNotFound { pattern, matches });
    }
    Ok(matches.remove(0))
}

/// Projection / device filter fragment shared by normal and anomalous names.
///
/// `AP_` when restricted to anterior-posterior views, then `sup_` or `no_sup_`.
pub fn filter_fragment(ap_only: bool, sup_devices: bool) -> String {
    let ap = if ap_only { "AP_" } else { "" };
    let sup = if sup_devices { "sup_" } else { "no_sup_" };
    format!("{ap}{sup}")
}

/// Filename prefix of a CheXpert normal-train manifest.
pub fn chexpert_normal_prefix(sex: Sex, ap_only: bool, sup_devices: bool) -> String {
    format!("{sex}_normal_train_{}", filter_fragment(ap_only, sup_devices))
}

/// Filename prefix of a CheXpert anomalous manifest for `pathology`.
pub fn chexpert_anomal_prefix(sex: Sex, pathology: &str, ap_only: bool, sup_devices: bool) -> String {
    format!(
        "{sex}_anomal_{pathology}_{}",
        filter_fragment(ap_only, sup_devices)
    )
}
