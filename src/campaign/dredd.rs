//! Environment protocol understood by Dredd-instrumented compilers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::tree::MutationId;

/// Comma-separated ids of the mutations to enable; absent means unmutated.
pub const ENABLED_MUTATION_VAR: &str = "DREDD_ENABLED_MUTATION";

/// File the tracking build writes covered mutation ids into, one per line.
pub const MUTANT_TRACKING_FILE_VAR: &str = "DREDD_MUTANT_TRACKING_FILE";

/// Coverage file errors.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// File could not be read.
    #[error("failed to read tracking file {path}: {source}")]
    Io {
        /// Tracking file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A line was not a mutation id.
    #[error("tracking file {path} line {line}: `{content}` is not a mutation id")]
    BadEntry {
        /// Tracking file path.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// Offending content.
        content: String,
    },
}

/// Value for [`ENABLED_MUTATION_VAR`] enabling exactly `mutations`.
pub fn enabled_mutation_value(mutations: &[MutationId]) -> String {
    mutations
        .iter()
        .map(MutationId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Environment enabling `mutations`.
pub fn mutant_env(mutations: &[MutationId]) -> Vec<(&'static str, String)> {
    vec![(ENABLED_MUTATION_VAR, enabled_mutation_value(mutations))]
}

/// Environment asking the tracking build to write coverage to `path`.
pub fn tracking_env(path: &Path) -> Vec<(&'static str, String)> {
    vec![(MUTANT_TRACKING_FILE_VAR, path.display().to_string())]
}

/// Covered mutations listed in a tracking file.
///
/// Blank lines are ignored and repeated ids collapse. A missing file means
/// the run reached no mutation at all.
pub fn read_tracking_file(path: &Path) -> Result<BTreeSet<MutationId>, TrackingError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(source) => {
            return Err(TrackingError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut covered = BTreeSet::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let id = line.parse::<MutationId>().map_err(|_| TrackingError::BadEntry {
            path: path.to_path_buf(),
            line: index + 1,
            content: line.to_string(),
        })?;
        covered.insert(id);
    }
    Ok(covered)
}
