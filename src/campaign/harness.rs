//! Test harness contract: where tests come from and how a run is judged.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

use super::dredd::TrackingError;
use super::process::ProcessError;
use super::tree::MutationId;
use super::verdict::Judgement;

/// Harness-level errors. Each one aborts the current test only.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Running an external command failed.
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    /// Coverage could not be read.
    #[error("coverage error: {0}")]
    Tracking(#[from] TrackingError),
    /// Scratch file handling failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Harness was configured inconsistently.
    #[error("invalid harness configuration: {0}")]
    Config(String),
}

/// One test program or suite query to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// Identity used to claim the test in the work directory.
    pub identity: String,
    /// File to keep alongside the test's summary, once it exists.
    pub artifact: Option<PathBuf>,
    /// Generator seed, for generated tests.
    pub seed: Option<u64>,
}

impl TestCase {
    /// Test with no artifact or seed.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            artifact: None,
            seed: None,
        }
    }

    /// Attach an artifact path.
    pub fn with_artifact(mut self, artifact: impl Into<PathBuf>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Attach a generator seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Source of tests plus the judging protocol for them.
///
/// `Ok(None)` from [`TestHarness::baseline`] or
/// [`TestHarness::covered_mutants`] marks the test unusable and it is
/// discarded.
pub trait TestHarness {
    /// Reference outcome of the unmutated compiler.
    type Baseline;
    /// Verdict produced for a mutated run.
    type Verdict: Judgement;

    /// Next test, or `None` once the source is exhausted.
    fn next_test(&mut self) -> Result<Option<TestCase>, HarnessError>;

    /// Claim the test before running its baseline.
    ///
    /// Fixed corpora are shared by every worker, so claiming first avoids
    /// duplicate baselines; generated tests are claimed only once usable.
    fn claim_before_baseline(&self) -> bool {
        false
    }

    /// Run `test` without mutation.
    fn baseline(&mut self, test: &TestCase) -> Result<Option<Self::Baseline>, HarnessError>;

    /// Mutations reached by `test`, from a tracking build.
    fn covered_mutants(
        &mut self,
        test: &TestCase,
        baseline: &Self::Baseline,
    ) -> Result<Option<BTreeSet<MutationId>>, HarnessError>;

    /// Run `test` with exactly `mutants` enabled and judge the result.
    fn run_mutants(
        &mut self,
        test: &TestCase,
        baseline: &Self::Baseline,
        mutants: &[MutationId],
    ) -> Result<Self::Verdict, HarnessError>;
}

/// Replace `{name}` placeholders in every argument.
pub fn expand_template(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// True if any argument mentions `{name}`.
pub fn template_uses(template: &[String], name: &str) -> bool {
    let placeholder = format!("{{{name}}}");
    template.iter().any(|arg| arg.contains(&placeholder))
}

pub(crate) fn remove_if_exists(path: &std::path::Path) -> Result<(), HarnessError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(HarnessError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
