//! Differential judging of a mutated run against its unmutated baseline.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::process::{ExecutionRecord, ProcessOutcome};
use super::verdict::{BinaryVerdict, SuiteVerdict};

/// Baseline of a compiled test program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryBaseline {
    /// Hex SHA-256 of the unmutated executable.
    pub binary_hash: String,
    /// Unmutated compile run, kept for timeout scaling.
    pub compile: ExecutionRecord,
    /// Unmutated execution of the program.
    pub execution: ExecutionRecord,
}

/// Judge one mutated build of a compiled test program.
///
/// `mutated_hash` is called only when compilation succeeded, and `execute`
/// only when the executable differs from baseline.
pub fn classify_binary<E>(
    baseline: &BinaryBaseline,
    compile: &ProcessOutcome,
    mutated_hash: impl FnOnce() -> Result<String, E>,
    execute: impl FnOnce() -> Result<ProcessOutcome, E>,
) -> Result<BinaryVerdict, E> {
    let compiled = match compile {
        ProcessOutcome::TimedOut => return Ok(BinaryVerdict::KillCompilerTimeout),
        ProcessOutcome::Completed(record) => record,
    };
    if !compiled.success() {
        return Ok(BinaryVerdict::KillCompilerCrash);
    }
    if mutated_hash()? == baseline.binary_hash {
        return Ok(BinaryVerdict::SurvivedIdentical);
    }
    Ok(compare_executions(&baseline.execution, &execute()?))
}

/// Compare a mutated execution against the baseline execution.
pub fn compare_executions(baseline: &ExecutionRecord, mutated: &ProcessOutcome) -> BinaryVerdict {
    let mutated = match mutated {
        ProcessOutcome::TimedOut => return BinaryVerdict::KillRuntimeTimeout,
        ProcessOutcome::Completed(record) => record,
    };
    if baseline.exit_code != mutated.exit_code {
        BinaryVerdict::KillDifferentExitCode
    } else if baseline.stdout != mutated.stdout {
        BinaryVerdict::KillDifferentStdout
    } else if baseline.stderr != mutated.stderr {
        BinaryVerdict::KillDifferentStderr
    } else {
        BinaryVerdict::SurvivedBinaryDifference
    }
}

/// Hex SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(to_hex(&hasher.finalize()))
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Status of one named sub-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubTestStatus {
    /// Sub-test passed.
    Pass,
    /// Sub-test failed.
    Fail,
}

/// Sub-test name to status.
pub type SubTestResults = BTreeMap<String, SubTestStatus>;

/// Outcome of a mutated suite run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteOutcome {
    /// Suite finished and reported these results.
    Completed(SubTestResults),
    /// Suite exceeded its timeout.
    TimedOut,
}

/// Judge a mutated suite run.
///
/// Only sub-tests that passed at baseline count. One that is missing from the
/// mutated report is treated as failing.
pub fn classify_suite(baseline: &SubTestResults, mutated: &SuiteOutcome) -> SuiteVerdict {
    let mutated = match mutated {
        SuiteOutcome::TimedOut => return SuiteVerdict::TestTimeout,
        SuiteOutcome::Completed(results) => results,
    };
    let newly_failing: BTreeSet<String> = baseline
        .iter()
        .filter(|(_, status)| **status == SubTestStatus::Pass)
        .filter(|(name, _)| mutated.get(*name) != Some(&SubTestStatus::Pass))
        .map(|(name, _)| name.clone())
        .collect();

    if newly_failing.is_empty() {
        SuiteVerdict::Survived
    } else {
        SuiteVerdict::KillTestFail { newly_failing }
    }
}

/// Parse per-sub-test results from suite runner output.
///
/// Understands lit-style `PASS: name (3 of 9)` lines and conformance-runner
/// style `name - pass` lines. Statuses other than pass or fail (`UNSUPPORTED`,
/// `XFAIL`, `skip`, ...) are ignored. `XPASS` and `TIMEOUT` count as failures.
pub fn parse_sub_test_results(output: &[u8]) -> SubTestResults {
    let text = String::from_utf8_lossy(output);
    let mut results = SubTestResults::new();
    for line in text.lines() {
        if let Some((name, status)) = parse_line(line.trim()) {
            results.insert(name.to_string(), status);
        }
    }
    results
}

fn parse_line(line: &str) -> Option<(&str, SubTestStatus)> {
    if let Some((tag, rest)) = line.split_once(": ") {
        let status = match tag {
            "PASS" => Some(SubTestStatus::Pass),
            "FAIL" | "XPASS" | "TIMEOUT" => Some(SubTestStatus::Fail),
            _ => None,
        };
        if let Some(status) = status {
            return Some((strip_progress(rest.trim()), status));
        }
    }
    let (name, tag) = line.rsplit_once(" - ")?;
    let status = match tag.trim() {
        "pass" => SubTestStatus::Pass,
        "fail" => SubTestStatus::Fail,
        _ => return None,
    };
    let name = name.trim();
    (!name.is_empty()).then_some((name, status))
}

/// Drop lit's trailing `(N of M)` progress counter.
fn strip_progress(name: &str) -> &str {
    match name.rsplit_once(" (") {
        Some((head, tail)) if tail.ends_with(')') && tail.contains(" of ") => head,
        _ => name,
    }
}
