//! Kill verdicts for the two judging protocols.
//!
//! Verdict names written to disk are fixed strings, independent of the Rust
//! variant names, so renaming a variant never changes persisted records.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Common view of a verdict, whichever protocol produced it.
pub trait Judgement: fmt::Display {
    /// True if the verdict demonstrates a behavioural difference.
    fn is_kill(&self) -> bool;

    /// Stable name persisted as `kill_type`.
    fn kill_type(&self) -> &'static str;

    /// Sub-tests the kill is attributed to, for suite-style verdicts.
    fn attributed_tests(&self) -> Option<&BTreeSet<String>> {
        None
    }
}

/// Unrecognised verdict name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown kill type `{0}`")]
pub struct UnknownKillType(pub String);

/// Verdict for a test whose compiled executable is compared against baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinaryVerdict {
    /// Mutated compiler produced a byte-identical executable.
    SurvivedIdentical,
    /// Executable changed but its observable behaviour did not.
    SurvivedBinaryDifference,
    /// Mutated compiler exited non-zero.
    KillCompilerCrash,
    /// Mutated compiler exceeded its timeout.
    KillCompilerTimeout,
    /// Mutated executable exceeded its timeout.
    KillRuntimeTimeout,
    /// Mutated executable exited with a different code.
    KillDifferentExitCode,
    /// Mutated executable printed different stdout.
    KillDifferentStdout,
    /// Mutated executable printed different stderr.
    KillDifferentStderr,
}

impl BinaryVerdict {
    /// Every verdict, survivals first.
    pub const ALL: [BinaryVerdict; 8] = [
        Self::SurvivedIdentical,
        Self::SurvivedBinaryDifference,
        Self::KillCompilerCrash,
        Self::KillCompilerTimeout,
        Self::KillRuntimeTimeout,
        Self::KillDifferentExitCode,
        Self::KillDifferentStdout,
        Self::KillDifferentStderr,
    ];

    /// Persisted name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SurvivedIdentical => "SURVIVED_IDENTICAL",
            Self::SurvivedBinaryDifference => "SURVIVED_BINARY_DIFFERENCE",
            Self::KillCompilerCrash => "KILL_COMPILER_CRASH",
            Self::KillCompilerTimeout => "KILL_COMPILER_TIMEOUT",
            Self::KillRuntimeTimeout => "KILL_RUNTIME_TIMEOUT",
            Self::KillDifferentExitCode => "KILL_DIFFERENT_EXIT_CODE",
            Self::KillDifferentStdout => "KILL_DIFFERENT_STDOUT",
            Self::KillDifferentStderr => "KILL_DIFFERENT_STDERR",
        }
    }

    /// True for kills that a test-case reducer can act on.
    ///
    /// Compiler crashes and compile timeouts are not.
    pub fn is_actionable(self) -> bool {
        matches!(
            self,
            Self::KillDifferentStdout | Self::KillDifferentExitCode | Self::KillRuntimeTimeout
        )
    }
}

impl Judgement for BinaryVerdict {
    fn is_kill(&self) -> bool {
        !matches!(self, Self::SurvivedIdentical | Self::SurvivedBinaryDifference)
    }

    fn kill_type(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for BinaryVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BinaryVerdict {
    type Err = UnknownKillType;

    /// Accepts current names plus the `KillStatus.`-prefixed names and the
    /// plural exit-code spelling found in older work directories.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let name = name.strip_prefix("KillStatus.").unwrap_or(name);
        let name = match name {
            "KILL_DIFFERENT_EXIT_CODES" => "KILL_DIFFERENT_EXIT_CODE",
            other => other,
        };
        Self::ALL
            .into_iter()
            .find(|verdict| verdict.as_str() == name)
            .ok_or_else(|| UnknownKillType(s.to_string()))
    }
}

impl Serialize for BinaryVerdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BinaryVerdict {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Verdict for a suite run that reports many named sub-tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteVerdict {
    /// No baseline-passing sub-test failed.
    Survived,
    /// These baseline-passing sub-tests failed under mutation.
    KillTestFail {
        /// Newly failing sub-tests.
        newly_failing: BTreeSet<String>,
    },
    /// The mutated suite run exceeded its timeout.
    TestTimeout,
}

impl SuiteVerdict {
    /// Persisted names, in declaration order.
    pub const NAMES: [&'static str; 3] = ["SURVIVED", "KILL_TEST_FAIL", "TEST_TIMEOUT"];
}

impl Judgement for SuiteVerdict {
    fn is_kill(&self) -> bool {
        !matches!(self, Self::Survived)
    }

    fn kill_type(&self) -> &'static str {
        match self {
            Self::Survived => Self::NAMES[0],
            Self::KillTestFail { .. } => Self::NAMES[1],
            Self::TestTimeout => Self::NAMES[2],
        }
    }

    fn attributed_tests(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::KillTestFail { newly_failing } => Some(newly_failing),
            _ => None,
        }
    }
}

impl fmt::Display for SuiteVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KillTestFail { newly_failing } => write!(
                f,
                "{} ({})",
                self.kill_type(),
                newly_failing.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
            _ => f.write_str(self.kill_type()),
        }
    }
}
