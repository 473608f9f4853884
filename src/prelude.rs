//! Prelude module for convenient imports.
//!
//! # Example
//!
//! ```rust,ignore
//! use dredd_campaign::prelude::*;
//! ```

pub use crate::campaign::{
    BinaryVerdict, CampaignConfig, CampaignController, CampaignError, CampaignOutcome,
    CompiledProgramHarness, Compilers, GeneratorSpec, Judgement, MutationId, MutationTree,
    StopReason, SuiteCommands, SuiteHarness, SuiteVerdict, TestCase, TestHarness, TimeoutConfig,
    WorkDir,
};
