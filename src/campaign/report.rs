//! Campaign results report built from a work directory.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::tree::MutationId;
use super::verdict::BinaryVerdict;
use super::workdir::{WorkDir, WorkDirError};

/// Supported output formats for campaign reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Markdown summary.
    Markdown,
    /// JSON summary with the reduction queue inline.
    Json,
}

/// One recorded kill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillRecord {
    /// Killed mutation.
    pub mutation: MutationId,
    /// Test that killed it.
    pub killing_test: String,
    /// Kill type, with legacy spellings normalized.
    pub kill_type: String,
}

/// Aggregated view of a work directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CampaignReport {
    /// Claimed test directories.
    pub tests_claimed: usize,
    /// Claimed tests with a written summary.
    pub tests_with_summary: usize,
    /// Summaries marked as cut short.
    pub tests_terminated_early: usize,
    /// Distinct mutations covered by any summarized test.
    pub covered_mutants: usize,
    /// Mutations with a kill directory.
    pub killed_mutants: usize,
    /// Covered mutations nobody has killed.
    pub surviving_mutants: usize,
    /// Kill directories whose record is not yet written.
    pub kills_without_record: usize,
    /// Kill counts per kill type.
    pub kills_by_type: BTreeMap<String, usize>,
    /// Kill counts per killing-test family.
    pub kills_by_test_prefix: BTreeMap<String, usize>,
    /// Kills a test-case reducer can act on, by mutation id.
    pub reduction_queue: Vec<KillRecord>,
}

impl CampaignReport {
    /// Scan `work`.
    pub fn scan(work: &WorkDir) -> Result<Self, WorkDirError> {
        let mut report = Self::default();

        let mut covered = BTreeSet::new();
        for dir in work.test_dirs()? {
            report.tests_claimed += 1;
            if let Some(summary) = work.load_summary(&dir)? {
                report.tests_with_summary += 1;
                if summary.terminated_early {
                    report.tests_terminated_early += 1;
                }
                covered.extend(summary.covered_mutants);
            }
        }

        let killed = work.killed_mutants()?;
        report.covered_mutants = covered.len();
        report.killed_mutants = killed.len();
        report.surviving_mutants = covered.difference(&killed).count();

        for mutation in killed {
            let Some(info) = work.load_kill_info(mutation)? else {
                report.kills_without_record += 1;
                continue;
            };
            let verdict = info.kill_type.parse::<BinaryVerdict>().ok();
            let kill_type = verdict
                .map(|v| v.as_str().to_string())
                .unwrap_or(info.kill_type);
            *report.kills_by_type.entry(kill_type.clone()).or_default() += 1;
            *report
                .kills_by_test_prefix
                .entry(test_prefix(&info.killing_test).to_string())
                .or_default() += 1;
            if verdict.is_some_and(BinaryVerdict::is_actionable) {
                report.reduction_queue.push(KillRecord {
                    mutation,
                    killing_test: info.killing_test,
                    kill_type,
                });
            }
        }
        Ok(report)
    }
}

/// Family of a test identity: its leading run of letters, digits and `-`.
///
/// `csmith_1734` and `csmith_99` share the family `csmith`.
pub fn test_prefix(identity: &str) -> &str {
    let end = identity
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(identity.len());
    if end == 0 { identity } else { &identity[..end] }
}

/// Render `report` in the requested format.
pub fn render_report(report: &CampaignReport, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Json => serde_json::to_string_pretty(report),
        ReportFormat::Markdown => Ok(render_markdown(report)),
    }
}

fn render_markdown(report: &CampaignReport) -> String {
    let mut out = String::from("# Mutation Testing Campaign\n\n");

    out.push_str("## Tests\n\n| metric | count |\n|---|---:|\n");
    out.push_str(&format!("| claimed | {} |\n", report.tests_claimed));
    out.push_str(&format!("| with summary | {} |\n", report.tests_with_summary));
    out.push_str(&format!(
        "| terminated early | {} |\n",
        report.tests_terminated_early
    ));

    out.push_str("\n## Mutants\n\n| metric | count |\n|---|---:|\n");
    out.push_str(&format!("| covered | {} |\n", report.covered_mutants));
    out.push_str(&format!("| killed | {} |\n", report.killed_mutants));
    out.push_str(&format!("| covered, not killed | {} |\n", report.surviving_mutants));
    if report.kills_without_record > 0 {
        out.push_str(&format!(
            "| kill record pending | {} |\n",
            report.kills_without_record
        ));
    }

    if !report.kills_by_type.is_empty() {
        out.push_str("\n## Kills by type\n\n| kill type | count |\n|---|---:|\n");
        for (kill_type, count) in &report.kills_by_type {
            out.push_str(&format!("| {kill_type} | {count} |\n"));
        }
    }

    if !report.kills_by_test_prefix.is_empty() {
        out.push_str("\n## Kills by test family\n\n| family | count |\n|---|---:|\n");
        for (prefix, count) in &report.kills_by_test_prefix {
            out.push_str(&format!("| {prefix} | {count} |\n"));
        }
    }

    if !report.reduction_queue.is_empty() {
        out.push_str("\n## Reduction queue\n\n| mutation | test | kill type |\n|---:|---|---|\n");
        for record in &report.reduction_queue {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                record.mutation, record.killing_test, record.kill_type
            ));
        }
    }

    out
}
