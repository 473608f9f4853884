//! Harness for test suites where one invocation runs many named sub-tests.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::classifier::{SubTestResults, SubTestStatus, SuiteOutcome, classify_suite, parse_sub_test_results};
use super::config::TimeoutConfig;
use super::dredd::{ENABLED_MUTATION_VAR, mutant_env, read_tracking_file, tracking_env};
use super::harness::{HarnessError, TestCase, TestHarness, expand_template, remove_if_exists, template_uses};
use super::process::{CommandSpec, ProcessOutcome, ProcessRunner};
use super::tree::MutationId;
use super::verdict::SuiteVerdict;

const TRACKING_FILE: &str = "__dredd_covered_mutants";

/// Baseline of one suite query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteBaseline {
    /// Sub-test results without mutation.
    pub results: SubTestResults,
    /// Wall-clock time of the unmutated run.
    pub elapsed: Duration,
}

/// Command templates for running one query; `{test}` is the query.
#[derive(Debug, Clone)]
pub struct SuiteCommands {
    /// Runs the query against the mutated build.
    pub mutated: Vec<String>,
    /// Runs the query against the tracking build.
    pub tracking: Vec<String>,
}

/// Suite harness judged by [`SuiteVerdict`].
pub struct SuiteHarness {
    queue: VecDeque<String>,
    commands: SuiteCommands,
    identity_prefix: String,
    timeouts: TimeoutConfig,
    runner: ProcessRunner,
    scratch: TempDir,
}

impl SuiteHarness {
    /// Harness over `tests`, in order. Identities are `identity_prefix`
    /// followed by the query.
    pub fn new(
        tests: impl IntoIterator<Item = String>,
        commands: SuiteCommands,
        identity_prefix: impl Into<String>,
        timeouts: TimeoutConfig,
    ) -> Result<Self, HarnessError> {
        for (name, template) in [("mutated", &commands.mutated), ("tracking", &commands.tracking)] {
            if !template_uses(template, "test") {
                return Err(HarnessError::Config(format!(
                    "{name} suite command must use {{test}}"
                )));
            }
        }
        let scratch = tempfile::tempdir().map_err(|source| HarnessError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        Ok(Self {
            queue: tests.into_iter().collect(),
            commands,
            identity_prefix: identity_prefix.into(),
            timeouts,
            runner: ProcessRunner::new(),
            scratch,
        })
    }

    /// Read queries from `path`, one per line; blank lines and `#` comments
    /// are skipped.
    pub fn read_test_list(path: &Path) -> Result<Vec<String>, HarnessError> {
        let raw = std::fs::read_to_string(path).map_err(|source| HarnessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    fn query<'a>(&self, test: &'a TestCase) -> &'a str {
        test.identity
            .strip_prefix(self.identity_prefix.as_str())
            .unwrap_or(&test.identity)
    }

    fn command(&self, template: &[String], test: &TestCase) -> Result<CommandSpec, HarnessError> {
        CommandSpec::from_argv(expand_template(template, &[("test", self.query(test))]))
            .ok_or_else(|| HarnessError::Config("suite command is empty".to_string()))
    }
}

impl TestHarness for SuiteHarness {
    type Baseline = SuiteBaseline;
    type Verdict = SuiteVerdict;

    fn next_test(&mut self) -> Result<Option<TestCase>, HarnessError> {
        Ok(self
            .queue
            .pop_front()
            .map(|query| TestCase::new(format!("{}{query}", self.identity_prefix))))
    }

    fn claim_before_baseline(&self) -> bool {
        true
    }

    fn baseline(&mut self, test: &TestCase) -> Result<Option<SuiteBaseline>, HarnessError> {
        let command = self.command(&self.commands.mutated, test)?;
        let record = match self
            .runner
            .run(&command, self.timeouts.run(), &[(ENABLED_MUTATION_VAR, "")])?
        {
            ProcessOutcome::TimedOut => {
                info!(test = %test.identity, "suite timed out without mutants");
                return Ok(None);
            }
            ProcessOutcome::Completed(record) => record,
        };
        let results = parse_sub_test_results(&record.stdout);
        if !results.values().any(|status| *status == SubTestStatus::Pass) {
            info!(test = %test.identity, "no sub-test passes without mutants");
            return Ok(None);
        }
        Ok(Some(SuiteBaseline {
            results,
            elapsed: record.elapsed,
        }))
    }

    fn covered_mutants(
        &mut self,
        test: &TestCase,
        baseline: &SuiteBaseline,
    ) -> Result<Option<BTreeSet<MutationId>>, HarnessError> {
        let tracking_file = self.scratch.path().join(TRACKING_FILE);
        remove_if_exists(&tracking_file)?;
        let command = self.command(&self.commands.tracking, test)?;
        let mut env = tracking_env(&tracking_file);
        env.push((ENABLED_MUTATION_VAR, String::new()));

        let record = match self.runner.run(&command, self.timeouts.run(), &env)? {
            ProcessOutcome::TimedOut => {
                info!(test = %test.identity, "suite timed out with mutant tracking");
                return Ok(None);
            }
            ProcessOutcome::Completed(record) => record,
        };
        if parse_sub_test_results(&record.stdout) != baseline.results {
            warn!(
                test = %test.identity,
                "tracking build disagrees with the unmutated build"
            );
            return Ok(None);
        }
        Ok(Some(read_tracking_file(&tracking_file)?))
    }

    fn run_mutants(
        &mut self,
        test: &TestCase,
        baseline: &SuiteBaseline,
        mutants: &[MutationId],
    ) -> Result<SuiteVerdict, HarnessError> {
        let command = self.command(&self.commands.mutated, test)?;
        let timeout = self.timeouts.mutant_run(baseline.elapsed);
        let outcome = match self.runner.run(&command, timeout, &mutant_env(mutants))? {
            ProcessOutcome::TimedOut => SuiteOutcome::TimedOut,
            ProcessOutcome::Completed(record) => {
                SuiteOutcome::Completed(parse_sub_test_results(&record.stdout))
            }
        };
        let verdict = classify_suite(&baseline.results, &outcome);
        debug!(test = %test.identity, ?mutants, %verdict, "suite run judged");
        Ok(verdict)
    }
}
