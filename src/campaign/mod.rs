//! Mutation-testing campaigns against Dredd-instrumented compilers.

pub mod batch;
pub mod classifier;
pub mod compiled;
pub mod config;
pub mod controller;
pub mod dredd;
pub mod harness;
pub mod policy;
pub mod process;
/// Human-readable and machine-friendly report generation.
pub mod report;
pub mod suite;
pub mod tree;
pub mod verdict;
pub mod workdir;

pub use batch::MutantBatcher;
pub use classifier::{
    BinaryBaseline, SubTestResults, SubTestStatus, SuiteOutcome, classify_binary, classify_suite,
    parse_sub_test_results,
};
pub use compiled::{CompiledProgramHarness, Compilers, GeneratorSpec};
pub use config::{CampaignConfig, TimeoutConfig};
pub use controller::{CampaignController, CampaignError, CampaignOutcome, request_stop};
pub use harness::{HarnessError, TestCase, TestHarness};
pub use policy::{CampaignClock, StopReason, StoppingPolicy, still_testing};
pub use process::{CommandSpec, ExecutionRecord, ProcessError, ProcessOutcome, ProcessRunner};
pub use report::{CampaignReport, KillRecord, ReportFormat, render_report};
pub use suite::{SuiteBaseline, SuiteCommands, SuiteHarness};
pub use tree::{MutationId, MutationTree, MutationTreeDocument, NodeId, TreeError};
pub use verdict::{BinaryVerdict, Judgement, SuiteVerdict, UnknownKillType};
pub use workdir::{KillClaim, KillInfo, KillSummary, TestClaim, TestDir, WorkDir, WorkDirError};
