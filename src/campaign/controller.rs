//! Campaign control loop.
//!
//! One worker runs one synchronous loop: obtain a test, baseline it, collect
//! coverage, batch the not-yet-killed covered mutations, judge each batch and
//! record kills. Any number of workers may share a work directory.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::batch::MutantBatcher;
use super::config::CampaignConfig;
use super::harness::{HarnessError, TestCase, TestHarness};
use super::policy::{CampaignClock, StopReason};
use super::tree::{MutationId, MutationTree, TreeError};
use super::verdict::Judgement;
use super::workdir::{KillClaim, KillInfo, KillSummary, TestClaim, TestDir, WorkDir, WorkDirError};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Campaign errors.
#[derive(Debug, Error)]
pub enum CampaignError {
    /// Mutation tree could not be loaded, or the two trees differ.
    #[error("mutation tree error: {0}")]
    Tree(#[from] TreeError),
    /// Work directory failure.
    #[error("work directory error: {0}")]
    WorkDir(#[from] WorkDirError),
    /// Harness failure.
    #[error("harness error: {0}")]
    Harness(#[from] HarnessError),
    /// The same document was given for both trees.
    #[error("mutation tree documents must be distinct files, got {0} twice")]
    SameTreeDocument(String),
    /// Signal handler installation failed.
    #[error("signal handler installation failed: {0}")]
    Signal(String),
}

/// Counters reported when a campaign stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CampaignOutcome {
    /// Why the loop ended.
    pub stop_reason: Option<StopReason>,
    /// Tests claimed and evaluated, including those cut short.
    pub tests_run: usize,
    /// Tests skipped because another run had claimed them.
    pub tests_skipped: usize,
    /// Tests discarded because their baseline or coverage was unusable.
    pub tests_unusable: usize,
    /// Tests abandoned after an error.
    pub tests_failed: usize,
    /// Kill records written by this worker.
    pub kills_recorded: usize,
}

fn install_signal_handler_once() -> Result<(), CampaignError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::SeqCst);
        })
        .map_err(|e| e.to_string())
    });

    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(CampaignError::Signal(msg.clone())),
    }
}

/// Ask every running campaign in this process to stop at the next check.
pub fn request_stop() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Drives a [`TestHarness`] against a shared work directory.
pub struct CampaignController<H: TestHarness> {
    config: CampaignConfig,
    tree: MutationTree,
    work: WorkDir,
    harness: H,
    rng: fastrand::Rng,
    killed: BTreeSet<MutationId>,
}

impl<H: TestHarness> CampaignController<H> {
    /// Controller for `tree`, which must match `tracking_tree` exactly.
    pub fn new(
        config: CampaignConfig,
        tree: MutationTree,
        tracking_tree: &MutationTree,
        harness: H,
    ) -> Result<Self, CampaignError> {
        tree.ensure_matches(tracking_tree)?;
        let work = WorkDir::open(&config.work_dir)?;
        let rng = config.rng();
        Ok(Self {
            config,
            tree,
            work,
            harness,
            rng,
            killed: BTreeSet::new(),
        })
    }

    /// Controller loading both trees from distinct documents.
    pub fn from_paths(
        config: CampaignConfig,
        tree_path: &Path,
        tracking_tree_path: &Path,
        harness: H,
    ) -> Result<Self, CampaignError> {
        if same_file(tree_path, tracking_tree_path) {
            return Err(CampaignError::SameTreeDocument(
                tree_path.display().to_string(),
            ));
        }
        info!(path = %tree_path.display(), "loading mutation tree");
        let tree = MutationTree::from_path(tree_path)?;
        info!(path = %tracking_tree_path.display(), "loading mutation tree for coverage tracking");
        let tracking_tree = MutationTree::from_path(tracking_tree_path)?;
        Self::new(config, tree, &tracking_tree, harness)
    }

    /// Work directory.
    pub fn work_dir(&self) -> &WorkDir {
        &self.work
    }

    /// Harness.
    pub fn harness(&self) -> &H {
        &self.harness
    }

    /// Run until the stopping policy fires, the source runs dry, or the
    /// process is interrupted.
    pub fn run(&mut self) -> Result<CampaignOutcome, CampaignError> {
        install_signal_handler_once()?;
        INTERRUPTED.store(false, Ordering::SeqCst);

        let mut clock = CampaignClock::start(self.config.stopping_policy());
        let mut outcome = CampaignOutcome::default();
        self.killed = self.work.killed_mutants()?;
        info!(
            mutations = self.tree.num_mutations(),
            already_killed = self.killed.len(),
            work_dir = %self.work.root().display(),
            "campaign started"
        );

        let reason = loop {
            if let Some(reason) = stop_reason(&clock) {
                break reason;
            }
            let Some(test) = self.harness.next_test()? else {
                break StopReason::SourceExhausted;
            };
            if let Err(err) = self.process_test(&test, &mut clock, &mut outcome) {
                warn!(test = %test.identity, error = %err, "abandoning test");
                outcome.tests_failed += 1;
            }
        };

        outcome.stop_reason = Some(reason);
        info!(
            ?reason,
            tests_run = outcome.tests_run,
            kills_recorded = outcome.kills_recorded,
            elapsed_secs = clock.elapsed().as_secs(),
            "campaign finished"
        );
        Ok(outcome)
    }

    fn process_test(
        &mut self,
        test: &TestCase,
        clock: &mut CampaignClock,
        outcome: &mut CampaignOutcome,
    ) -> Result<(), CampaignError> {
        let early_claim = if self.harness.claim_before_baseline() {
            match self.claim(test, outcome)? {
                Some(dir) => Some(dir),
                None => return Ok(()),
            }
        } else {
            None
        };

        let Some(baseline) = self.harness.baseline(test)? else {
            debug!(test = %test.identity, "baseline unusable");
            outcome.tests_unusable += 1;
            return Ok(());
        };
        let Some(covered) = self.harness.covered_mutants(test, &baseline)? else {
            debug!(test = %test.identity, "coverage unusable");
            outcome.tests_unusable += 1;
            return Ok(());
        };

        let dir = match early_claim {
            Some(dir) => dir,
            None => match self.claim(test, outcome)? {
                Some(dir) => dir,
                None => return Ok(()),
            },
        };
        if let Some(artifact) = test.artifact.as_deref().filter(|path| path.is_file()) {
            dir.store_artifact(artifact)?;
        }
        outcome.tests_run += 1;

        let (covered, unknown): (BTreeSet<MutationId>, BTreeSet<MutationId>) =
            covered.into_iter().partition(|id| self.tree.contains(*id));
        if !unknown.is_empty() {
            warn!(test = %test.identity, ?unknown, "ignoring covered ids absent from the mutation tree");
        }

        let mut summary = KillSummary {
            covered_mutants: covered,
            ..KillSummary::default()
        };
        let result = self.evaluate(test, &baseline, &mut summary, clock, outcome);
        if result.is_err() {
            summary.terminated_early = true;
        }
        self.finish(&dir, &mut summary)?;
        result
    }

    fn claim(
        &self,
        test: &TestCase,
        outcome: &mut CampaignOutcome,
    ) -> Result<Option<TestDir>, CampaignError> {
        match self.work.claim_test(&test.identity)? {
            TestClaim::Claimed(dir) => Ok(Some(dir)),
            TestClaim::AlreadyClaimed => {
                info!(test = %test.identity, "skipping test claimed by another run");
                outcome.tests_skipped += 1;
                Ok(None)
            }
        }
    }

    fn evaluate(
        &mut self,
        test: &TestCase,
        baseline: &H::Baseline,
        summary: &mut KillSummary,
        clock: &mut CampaignClock,
        outcome: &mut CampaignOutcome,
    ) -> Result<(), CampaignError> {
        self.killed.extend(self.work.killed_mutants()?);

        let mut candidates = Vec::new();
        for &mutation in &summary.covered_mutants {
            if self.killed.contains(&mutation) {
                summary.skipped_mutants.insert(mutation);
            } else {
                candidates.push(mutation);
            }
        }
        if self.config.shuffle_candidates {
            self.rng.shuffle(&mut candidates);
        }
        let batches = MutantBatcher::new(&self.tree, self.config.batch_size).batches(&candidates)?;
        info!(
            test = %test.identity,
            covered = summary.covered_mutants.len(),
            candidates = candidates.len(),
            batches = batches.len(),
            "evaluating test"
        );

        for batch in batches {
            if stop_reason(clock).is_some() {
                summary.terminated_early = true;
                return Ok(());
            }
            let batch: Vec<MutationId> = batch
                .into_iter()
                .filter(|mutation| !self.observe_existing_kill(*mutation, summary))
                .collect();

            if batch.len() > 1 {
                let verdict = self.harness.run_mutants(test, baseline, &batch)?;
                debug!(test = %test.identity, ?batch, %verdict, "batch judged");
                if !verdict.is_kill() {
                    summary.survived_mutants.extend(batch);
                    continue;
                }
            }

            for mutation in batch {
                if stop_reason(clock).is_some() {
                    summary.terminated_early = true;
                    return Ok(());
                }
                if self.observe_existing_kill(mutation, summary) {
                    continue;
                }
                let verdict = self.harness.run_mutants(test, baseline, &[mutation])?;
                if !verdict.is_kill() {
                    summary.survived_mutants.insert(mutation);
                    continue;
                }
                clock.record_kill();
                self.killed.insert(mutation);
                match self
                    .work
                    .claim_kill(mutation, &KillInfo::from_verdict(&test.identity, &verdict))?
                {
                    KillClaim::Recorded => {
                        summary.killed_mutants.insert(mutation);
                        outcome.kills_recorded += 1;
                        info!(
                            test = %test.identity,
                            %mutation,
                            %verdict,
                            killed_so_far = self.killed.len(),
                            "kill"
                        );
                    }
                    KillClaim::AlreadyRecorded => {
                        summary.skipped_mutants.insert(mutation);
                        info!(%mutation, "kill was independently discovered by another run");
                    }
                }
            }
        }
        Ok(())
    }

    /// True if `mutation` is already recorded as killed on disk.
    fn observe_existing_kill(&mut self, mutation: MutationId, summary: &mut KillSummary) -> bool {
        if !self.work.is_killed(mutation) {
            return false;
        }
        debug!(%mutation, "skipping mutant noted as already killed");
        self.killed.insert(mutation);
        summary.skipped_mutants.insert(mutation);
        true
    }

    fn finish(&self, dir: &TestDir, summary: &mut KillSummary) -> Result<(), CampaignError> {
        let considered: BTreeSet<MutationId> = summary
            .killed_mutants
            .iter()
            .chain(&summary.skipped_mutants)
            .chain(&summary.survived_mutants)
            .copied()
            .collect();
        if considered != summary.covered_mutants {
            summary.terminated_early = true;
        }
        dir.write_summary(summary)?;
        info!(
            test = %dir.identity(),
            killed = summary.killed_mutants.len(),
            skipped = summary.skipped_mutants.len(),
            survived = summary.survived_mutants.len(),
            terminated_early = summary.terminated_early,
            "test finished"
        );
        Ok(())
    }
}

fn stop_reason(clock: &CampaignClock) -> Option<StopReason> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        Some(StopReason::Interrupted)
    } else {
        clock.stop_reason()
    }
}

/// Compares resolved paths; falls back to the paths as given when either
/// cannot be resolved.
fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard};

    use tempfile::tempdir;

    use super::*;
    use crate::campaign::tree::MutationTreeDocument;
    use crate::campaign::verdict::BinaryVerdict;
    use crate::campaign::workdir::KILL_INFO_FILE;

    fn test_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ten mutations on ten unrelated root nodes.
    fn flat_tree() -> MutationTree {
        MutationTree::from_document(MutationTreeDocument {
            mutation_to_node: (0..10).map(|m| (m, m)).collect(),
            parent: BTreeMap::new(),
            num_nodes: 10,
            num_mutations: 10,
        })
        .expect("tree should build")
    }

    #[derive(Default)]
    struct FakeHarness {
        tests: VecDeque<TestCase>,
        covered: BTreeSet<MutationId>,
        killers: BTreeSet<MutationId>,
        unusable: BTreeSet<String>,
        interrupt_after_runs: Option<usize>,
        claim_first: bool,
        calls: Arc<Mutex<Vec<Vec<MutationId>>>>,
    }

    impl FakeHarness {
        fn new(tests: &[&str], covered: &[u64], killers: &[u64]) -> Self {
            Self {
                tests: tests.iter().map(|t| TestCase::new(*t)).collect(),
                covered: covered.iter().copied().map(MutationId).collect(),
                killers: killers.iter().copied().map(MutationId).collect(),
                ..Self::default()
            }
        }
    }

    impl TestHarness for FakeHarness {
        type Baseline = ();
        type Verdict = BinaryVerdict;

        fn next_test(&mut self) -> Result<Option<TestCase>, HarnessError> {
            Ok(self.tests.pop_front())
        }

        fn claim_before_baseline(&self) -> bool {
            self.claim_first
        }

        fn baseline(&mut self, test: &TestCase) -> Result<Option<()>, HarnessError> {
            Ok((!self.unusable.contains(&test.identity)).then_some(()))
        }

        fn covered_mutants(
            &mut self,
            _test: &TestCase,
            _baseline: &(),
        ) -> Result<Option<BTreeSet<MutationId>>, HarnessError> {
            Ok(Some(self.covered.clone()))
        }

        fn run_mutants(
            &mut self,
            _test: &TestCase,
            _baseline: &(),
            mutants: &[MutationId],
        ) -> Result<BinaryVerdict, HarnessError> {
            let mut calls = self.calls.lock().expect("calls mutex should lock");
            calls.push(mutants.to_vec());
            if self.interrupt_after_runs == Some(calls.len()) {
                request_stop();
            }
            if mutants.iter().any(|m| self.killers.contains(m)) {
                Ok(BinaryVerdict::KillDifferentStdout)
            } else {
                Ok(BinaryVerdict::SurvivedBinaryDifference)
            }
        }
    }

    fn config(work: &Path, batch_size: usize) -> CampaignConfig {
        CampaignConfig::default()
            .with_work_dir(work)
            .with_batch_size(std::num::NonZeroUsize::new(batch_size).expect("batch size should be non-zero"))
            .with_total_time_secs(0)
            .with_max_idle_secs(0)
            .with_seed(1)
    }

    fn controller(work: &Path, batch_size: usize, harness: FakeHarness) -> CampaignController<FakeHarness> {
        let tree = flat_tree();
        let tracking = flat_tree();
        CampaignController::new(config(work, batch_size), tree, &tracking, harness)
            .expect("controller should build")
    }

    fn ids(raw: &[u64]) -> BTreeSet<MutationId> {
        raw.iter().copied().map(MutationId).collect()
    }

    fn summary(work: &WorkDir, test: &str) -> KillSummary {
        work.load_summary(test)
            .expect("summary should load")
            .expect("summary should exist")
    }

    #[test]
    fn kills_are_recorded_once_and_later_tests_skip_them() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let harness = FakeHarness::new(&["t1", "t2"], &[1, 2, 3], &[2]);
        let calls = Arc::clone(&harness.calls);
        let mut controller = controller(tmp.path(), 1, harness);

        let outcome = controller.run().expect("campaign should run");
        assert_eq!(outcome.stop_reason, Some(StopReason::SourceExhausted));
        assert_eq!(outcome.tests_run, 2);
        assert_eq!(outcome.kills_recorded, 1);

        let work = controller.work_dir();
        let first = summary(work, "t1");
        assert_eq!(first.killed_mutants, ids(&[2]));
        assert_eq!(first.survived_mutants, ids(&[1, 3]));
        assert!(!first.terminated_early);

        let second = summary(work, "t2");
        assert_eq!(second.skipped_mutants, ids(&[2]));
        assert_eq!(second.survived_mutants, ids(&[1, 3]));

        let info = work
            .load_kill_info(MutationId(2))
            .expect("kill info should load")
            .expect("kill info should exist");
        assert_eq!(info.killing_test, "t1");
        assert_eq!(info.kill_type, "KILL_DIFFERENT_STDOUT");

        let calls = calls.lock().expect("calls mutex should lock");
        assert_eq!(calls.len(), 5, "t2 must not rerun the killed mutant");
    }

    #[test]
    fn resume_treats_existing_kill_records_as_already_killed() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let work = WorkDir::open(tmp.path()).expect("work dir should open");
        for id in [3, 7] {
            work.claim_kill(
                MutationId(id),
                &KillInfo::from_verdict("earlier_run", &BinaryVerdict::KillCompilerCrash),
            )
            .expect("pre-existing kill should be recorded");
        }

        let harness = FakeHarness::new(&["t1"], &[3, 5, 7], &[3, 5, 7]);
        let calls = Arc::clone(&harness.calls);
        let mut controller = controller(tmp.path(), 1, harness);
        controller.run().expect("campaign should run");

        let result = summary(controller.work_dir(), "t1");
        assert_eq!(result.skipped_mutants, ids(&[3, 7]));
        assert_eq!(result.killed_mutants, ids(&[5]));
        assert_eq!(
            *calls.lock().expect("calls mutex should lock"),
            vec![vec![MutationId(5)]]
        );
        for id in [3, 7] {
            let info = controller
                .work_dir()
                .load_kill_info(MutationId(id))
                .expect("kill info should load")
                .expect("kill info should exist");
            assert_eq!(info.killing_test, "earlier_run");
            let entries = std::fs::read_dir(tmp.path().join("killed_mutants").join(id.to_string()))
                .expect("kill dir should be readable")
                .count();
            assert_eq!(entries, 1);
            assert!(tmp
                .path()
                .join("killed_mutants")
                .join(id.to_string())
                .join(KILL_INFO_FILE)
                .is_file());
        }
    }

    #[test]
    fn surviving_batch_is_not_exploded() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let harness = FakeHarness::new(&["t1"], &[0, 1, 2, 3], &[]);
        let calls = Arc::clone(&harness.calls);
        let mut controller = controller(tmp.path(), 4, harness);
        controller.run().expect("campaign should run");

        let calls = calls.lock().expect("calls mutex should lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 4);
        assert_eq!(summary(controller.work_dir(), "t1").survived_mutants, ids(&[0, 1, 2, 3]));
    }

    #[test]
    fn killed_batch_is_exploded_into_single_trials() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let harness = FakeHarness::new(&["t1"], &[0, 1, 2, 3], &[2]);
        let calls = Arc::clone(&harness.calls);
        let mut controller = controller(tmp.path(), 4, harness);
        controller.run().expect("campaign should run");

        let calls = calls.lock().expect("calls mutex should lock");
        assert_eq!(calls.len(), 5);
        assert!(calls[1..].iter().all(|call| call.len() == 1));
        let result = summary(controller.work_dir(), "t1");
        assert_eq!(result.killed_mutants, ids(&[2]));
        assert_eq!(result.survived_mutants, ids(&[0, 1, 3]));
    }

    #[test]
    fn claimed_and_unusable_tests_are_skipped() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let work = WorkDir::open(tmp.path()).expect("work dir should open");
        assert!(matches!(
            work.claim_test("taken").expect("claim should work"),
            TestClaim::Claimed(_)
        ));

        let mut harness = FakeHarness::new(&["taken", "broken", "fine"], &[1], &[]);
        harness.unusable.insert("broken".to_string());
        let mut controller = controller(tmp.path(), 1, harness);
        let outcome = controller.run().expect("campaign should run");

        assert_eq!(outcome.tests_skipped, 1);
        assert_eq!(outcome.tests_unusable, 1);
        assert_eq!(outcome.tests_run, 1);
        assert!(!tmp.path().join("tests/broken").exists());
        assert!(controller.work_dir().load_summary("taken").expect("load should work").is_none());
    }

    #[test]
    fn early_claim_keeps_unusable_tests_claimed() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let mut harness = FakeHarness::new(&["broken"], &[1], &[]);
        harness.unusable.insert("broken".to_string());
        harness.claim_first = true;
        let mut controller = controller(tmp.path(), 1, harness);
        let outcome = controller.run().expect("campaign should run");

        assert_eq!(outcome.tests_unusable, 1);
        assert!(tmp.path().join("tests/broken").is_dir());
    }

    #[test]
    fn interrupt_mid_test_marks_it_terminated_early() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let mut harness = FakeHarness::new(&["t1", "t2"], &[1, 2, 3], &[]);
        harness.interrupt_after_runs = Some(1);
        let mut controller = controller(tmp.path(), 1, harness);
        let outcome = controller.run().expect("campaign should run");

        assert_eq!(outcome.stop_reason, Some(StopReason::Interrupted));
        assert_eq!(outcome.tests_run, 1);
        let result = summary(controller.work_dir(), "t1");
        assert!(result.terminated_early);
        assert_eq!(result.survived_mutants.len(), 1);
        assert!(!tmp.path().join("tests/t2").exists());
    }

    #[test]
    fn mismatched_or_identical_tree_paths_abort_startup() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut doc = flat_tree().document().clone();
        doc.parent.insert(1, 0);
        let other = MutationTree::from_document(doc).expect("tree should build");
        let err = CampaignController::new(
            config(tmp.path(), 1),
            flat_tree(),
            &other,
            FakeHarness::default(),
        )
        .err()
        .expect("mismatched trees should abort");
        assert!(matches!(err, CampaignError::Tree(TreeError::Mismatch { field: "parent" })));

        let path = tmp.path().join("info.json");
        let err = CampaignController::from_paths(config(tmp.path(), 1), &path, &path, FakeHarness::default())
            .err()
            .expect("identical paths should abort");
        assert!(matches!(err, CampaignError::SameTreeDocument(_)));
    }

    #[test]
    fn differently_spelled_paths_to_one_tree_abort_startup() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("info.json");
        std::fs::write(
            &path,
            serde_json::to_string(flat_tree().document()).expect("tree should serialize"),
        )
        .expect("tree should be written");
        let dotted = tmp.path().join(".").join("info.json");

        let err = CampaignController::from_paths(
            config(tmp.path(), 1),
            &path,
            &dotted,
            FakeHarness::default(),
        )
        .err()
        .expect("same file under two spellings should abort");
        assert!(matches!(err, CampaignError::SameTreeDocument(_)));
    }

    #[test]
    fn unknown_covered_ids_are_dropped() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let harness = FakeHarness::new(&["t1"], &[1, 42], &[]);
        let mut controller = controller(tmp.path(), 1, harness);
        controller.run().expect("campaign should run");

        let result = summary(controller.work_dir(), "t1");
        assert_eq!(result.covered_mutants, ids(&[1]));
        assert!(!result.terminated_early);
    }
}
