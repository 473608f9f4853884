//! Shared work directory used to coordinate concurrent campaign workers.
//!
//! Layout:
//!
//! ```text
//! <root>/tests/<test-identity>/kill_summary.json
//! <root>/killed_mutants/<mutation-id>/kill_info.json
//! ```
//!
//! Creating a directory is the only synchronization primitive. Whoever
//! creates `tests/<identity>` owns that test; whoever creates
//! `killed_mutants/<id>` is the sole writer of that kill record.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::classifier::to_hex;
use super::tree::MutationId;
use super::verdict::Judgement;

/// File name of a per-test summary.
pub const KILL_SUMMARY_FILE: &str = "kill_summary.json";
/// File name of a kill record.
pub const KILL_INFO_FILE: &str = "kill_info.json";

const MAX_IDENTITY_LEN: usize = 120;
const HASHED_PREFIX_LEN: usize = 100;

/// Work directory errors.
#[derive(Debug, Error)]
pub enum WorkDirError {
    /// Filesystem operation failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A JSON record could not be read or written.
    #[error("invalid json in {path}: {source}")]
    Json {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WorkDirError + '_ {
    move |source| WorkDirError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Record written by the worker that first killed a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillInfo {
    /// Identity of the killing test.
    pub killing_test: String,
    /// Persisted verdict name.
    pub kill_type: String,
    /// Sub-tests the kill is attributed to, for suite-style campaigns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killing_tests: Option<Vec<String>>,
}

impl KillInfo {
    /// Kill record for `verdict` observed on test `killing_test`.
    pub fn from_verdict(killing_test: impl Into<String>, verdict: &impl Judgement) -> Self {
        Self {
            killing_test: killing_test.into(),
            kill_type: verdict.kill_type().to_string(),
            killing_tests: verdict
                .attributed_tests()
                .map(|tests| tests.iter().cloned().collect()),
        }
    }
}

/// Per-test outcome summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSummary {
    /// Mutations the test reached.
    pub covered_mutants: BTreeSet<MutationId>,
    /// Mutations whose kill this test recorded.
    pub killed_mutants: BTreeSet<MutationId>,
    /// Covered mutations already killed by some other test.
    pub skipped_mutants: BTreeSet<MutationId>,
    /// Covered mutations this test did not kill.
    pub survived_mutants: BTreeSet<MutationId>,
    /// True if the stopping policy cut processing short.
    pub terminated_early: bool,
}

/// Result of trying to claim a test identity.
#[derive(Debug)]
pub enum TestClaim {
    /// This worker now owns the test.
    Claimed(TestDir),
    /// Another run already owns the test.
    AlreadyClaimed,
}

/// Result of trying to record a kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillClaim {
    /// This worker created the record.
    Recorded,
    /// A record already existed; nothing was written.
    AlreadyRecorded,
}

/// A claimed `tests/<identity>` directory.
#[derive(Debug, Clone)]
pub struct TestDir {
    identity: String,
    path: PathBuf,
}

impl TestDir {
    /// Test identity as given to [`WorkDir::claim_test`].
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy `artifact` into this directory under its own file name.
    pub fn store_artifact(&self, artifact: &Path) -> Result<PathBuf, WorkDirError> {
        let name = artifact.file_name().unwrap_or(artifact.as_os_str());
        let dest = self.path.join(name);
        std::fs::copy(artifact, &dest).map_err(io_error(artifact))?;
        Ok(dest)
    }

    /// Persist this test's summary.
    pub fn write_summary(&self, summary: &KillSummary) -> Result<(), WorkDirError> {
        write_json_atomic(&self.path.join(KILL_SUMMARY_FILE), summary)
    }
}

/// Handle on a shared work directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    tests: PathBuf,
    killed: PathBuf,
}

impl WorkDir {
    /// Open `root`, creating `tests/` and `killed_mutants/` if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, WorkDirError> {
        let root = root.into();
        let tests = root.join("tests");
        let killed = root.join("killed_mutants");
        std::fs::create_dir_all(&tests).map_err(io_error(&tests))?;
        std::fs::create_dir_all(&killed).map_err(io_error(&killed))?;
        Ok(Self {
            root,
            tests,
            killed,
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Claim `identity` for this worker.
    pub fn claim_test(&self, identity: &str) -> Result<TestClaim, WorkDirError> {
        let path = self.tests.join(directory_name(identity));
        match std::fs::create_dir(&path) {
            Ok(()) => Ok(TestClaim::Claimed(TestDir {
                identity: identity.to_string(),
                path,
            })),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(identity, "test already claimed");
                Ok(TestClaim::AlreadyClaimed)
            }
            Err(source) => Err(WorkDirError::Io { path, source }),
        }
    }

    /// Record that `mutation` was killed, unless someone already did.
    ///
    /// `kill_info.json` is written only by the worker whose directory
    /// creation succeeded.
    pub fn claim_kill(&self, mutation: MutationId, info: &KillInfo) -> Result<KillClaim, WorkDirError> {
        let path = self.kill_dir(mutation);
        match std::fs::create_dir(&path) {
            Ok(()) => {
                write_json_atomic(&path.join(KILL_INFO_FILE), info)?;
                Ok(KillClaim::Recorded)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(KillClaim::AlreadyRecorded),
            Err(source) => Err(WorkDirError::Io { path, source }),
        }
    }

    /// True if any worker has recorded a kill of `mutation`.
    pub fn is_killed(&self, mutation: MutationId) -> bool {
        self.kill_dir(mutation).is_dir()
    }

    /// Every mutation with a kill record.
    pub fn killed_mutants(&self) -> Result<BTreeSet<MutationId>, WorkDirError> {
        let mut out = BTreeSet::new();
        for name in list_dir_names(&self.killed)? {
            match name.parse::<MutationId>() {
                Ok(id) => {
                    out.insert(id);
                }
                Err(_) => debug!(entry = %name, "ignoring stray entry in killed_mutants"),
            }
        }
        Ok(out)
    }

    /// Kill record for `mutation`, if one has been written.
    pub fn load_kill_info(&self, mutation: MutationId) -> Result<Option<KillInfo>, WorkDirError> {
        read_json_if_exists(&self.kill_dir(mutation).join(KILL_INFO_FILE))
    }

    /// Directory names of every claimed test.
    pub fn test_dirs(&self) -> Result<Vec<String>, WorkDirError> {
        list_dir_names(&self.tests)
    }

    /// Summary stored in test directory `dir_name`, if written.
    pub fn load_summary(&self, dir_name: &str) -> Result<Option<KillSummary>, WorkDirError> {
        read_json_if_exists(&self.tests.join(dir_name).join(KILL_SUMMARY_FILE))
    }

    fn kill_dir(&self, mutation: MutationId) -> PathBuf {
        self.killed.join(mutation.to_string())
    }
}

/// Single path component for a test identity.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`. Overlong identities are
/// truncated and suffixed with a hash of the full identity.
pub fn directory_name(identity: &str) -> String {
    let mut name: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.chars().all(|c| c == '.') {
        name = format!("_{name}");
    }
    if name.len() > MAX_IDENTITY_LEN {
        let digest = to_hex(&Sha256::digest(identity.as_bytes()));
        name.truncate(HASHED_PREFIX_LEN);
        name.push('-');
        name.push_str(&digest[..16]);
    }
    name
}

fn list_dir_names(dir: &Path) -> Result<Vec<String>, WorkDirError> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        if entry.file_type().map_err(io_error(dir))?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), WorkDirError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|source| WorkDirError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(b"\n").map_err(io_error(path))?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path).map_err(|err| WorkDirError::Io {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, WorkDirError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(WorkDirError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| WorkDirError::Json {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use tempfile::tempdir;

    use super::*;
    use crate::campaign::verdict::{BinaryVerdict, SuiteVerdict};

    fn info(test: &str) -> KillInfo {
        KillInfo::from_verdict(test, &BinaryVerdict::KillDifferentStdout)
    }

    #[test]
    fn open_creates_layout_and_is_reentrant() {
        let tmp = tempdir().expect("tempdir should be created");
        let root = tmp.path().join("work");
        WorkDir::open(&root).expect("work dir should open");
        WorkDir::open(&root).expect("work dir should reopen");
        assert!(root.join("tests").is_dir());
        assert!(root.join("killed_mutants").is_dir());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let tmp = tempdir().expect("tempdir should be created");
        let work = WorkDir::open(tmp.path()).expect("work dir should open");

        let claim = work.claim_test("csmith_17").expect("claim should succeed");
        let dir = match claim {
            TestClaim::Claimed(dir) => dir,
            TestClaim::AlreadyClaimed => panic!("first claim should win"),
        };
        assert_eq!(dir.identity(), "csmith_17");
        assert!(matches!(
            work.claim_test("csmith_17").expect("second claim should not error"),
            TestClaim::AlreadyClaimed
        ));
    }

    #[test]
    fn concurrent_kill_claims_have_one_winner_and_one_record() {
        let tmp = tempdir().expect("tempdir should be created");
        let work = Arc::new(WorkDir::open(tmp.path()).expect("work dir should open"));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["worker-a", "worker-b"]
            .into_iter()
            .map(|name| {
                let work = Arc::clone(&work);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let claim = work
                        .claim_kill(MutationId(42), &info(name))
                        .expect("claim should not error");
                    (name, claim)
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("worker thread should finish"))
            .collect();

        let winners: Vec<_> = results
            .iter()
            .filter(|(_, claim)| *claim == KillClaim::Recorded)
            .collect();
        assert_eq!(winners.len(), 1);

        let record = work
            .load_kill_info(MutationId(42))
            .expect("kill info should load")
            .expect("kill info should exist");
        assert_eq!(record.killing_test, winners[0].0);

        let files: Vec<_> = std::fs::read_dir(tmp.path().join("killed_mutants/42"))
            .expect("kill dir should be readable")
            .collect();
        assert_eq!(files.len(), 1, "only kill_info.json should exist");
    }

    #[test]
    fn losing_kill_claim_leaves_existing_record_untouched() {
        let tmp = tempdir().expect("tempdir should be created");
        let work = WorkDir::open(tmp.path()).expect("work dir should open");

        assert_eq!(
            work.claim_kill(MutationId(3), &info("first")).expect("claim should work"),
            KillClaim::Recorded
        );
        assert_eq!(
            work.claim_kill(MutationId(3), &info("second")).expect("claim should work"),
            KillClaim::AlreadyRecorded
        );
        let record = work
            .load_kill_info(MutationId(3))
            .expect("kill info should load")
            .expect("kill info should exist");
        assert_eq!(record.killing_test, "first");
        assert!(work.is_killed(MutationId(3)));
        assert!(!work.is_killed(MutationId(4)));
    }

    #[test]
    fn killed_set_comes_from_the_filesystem() {
        let tmp = tempdir().expect("tempdir should be created");
        let work = WorkDir::open(tmp.path()).expect("work dir should open");
        std::fs::create_dir(tmp.path().join("killed_mutants/7")).expect("dir should be created");
        std::fs::create_dir(tmp.path().join("killed_mutants/junk")).expect("dir should be created");
        work.claim_kill(MutationId(3), &info("t")).expect("claim should work");

        assert_eq!(
            work.killed_mutants().expect("scan should work"),
            BTreeSet::from([MutationId(3), MutationId(7)])
        );
        // A claim directory without its record yet is still a kill.
        assert_eq!(work.load_kill_info(MutationId(7)).expect("load should work"), None);
    }

    #[test]
    fn kill_info_json_shape() {
        let suite = SuiteVerdict::KillTestFail {
            newly_failing: BTreeSet::from(["T1".to_string()]),
        };
        let json = serde_json::to_value(KillInfo::from_verdict("query_x", &suite))
            .expect("kill info should serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "killing_test": "query_x",
                "kill_type": "KILL_TEST_FAIL",
                "killing_tests": ["T1"],
            })
        );

        let json = serde_json::to_value(info("csmith_1")).expect("kill info should serialize");
        assert!(json.get("killing_tests").is_none());
    }

    #[test]
    fn summary_round_trips_through_the_test_dir() {
        let tmp = tempdir().expect("tempdir should be created");
        let work = WorkDir::open(tmp.path()).expect("work dir should open");
        let TestClaim::Claimed(dir) = work.claim_test("prog/a.c").expect("claim should work") else {
            panic!("claim should win");
        };

        let summary = KillSummary {
            covered_mutants: BTreeSet::from([MutationId(9), MutationId(1)]),
            killed_mutants: BTreeSet::from([MutationId(9)]),
            survived_mutants: BTreeSet::from([MutationId(1)]),
            ..KillSummary::default()
        };
        dir.write_summary(&summary).expect("summary should be written");

        let raw = std::fs::read_to_string(dir.path().join(KILL_SUMMARY_FILE))
            .expect("summary should be readable");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("summary should be json");
        assert_eq!(value["covered_mutants"], serde_json::json!([1, 9]));
        assert_eq!(value["terminated_early"], serde_json::json!(false));

        assert_eq!(
            work.load_summary("prog_a.c").expect("summary should load"),
            Some(summary)
        );
        assert_eq!(work.test_dirs().expect("listing should work"), vec!["prog_a.c"]);
    }

    #[test]
    fn artifacts_are_copied_into_the_claim() {
        let tmp = tempdir().expect("tempdir should be created");
        let work = WorkDir::open(tmp.path().join("work")).expect("work dir should open");
        let source = tmp.path().join("prog.c");
        std::fs::write(&source, "int main(void) { return 0; }").expect("source should be written");

        let TestClaim::Claimed(dir) = work.claim_test("csmith_1").expect("claim should work") else {
            panic!("claim should win");
        };
        let stored = dir.store_artifact(&source).expect("artifact should be stored");
        assert_eq!(stored, dir.path().join("prog.c"));
        assert!(stored.is_file());
    }

    #[test]
    fn directory_names_are_safe_and_distinct() {
        assert_eq!(directory_name("csmith_42"), "csmith_42");
        assert_eq!(directory_name("webgpu:shader,exec:*"), "webgpu_shader_exec__");
        assert_eq!(directory_name(".."), "_..");

        let long_a = format!("query_{}", "a".repeat(300));
        let long_b = format!("query_{}b", "a".repeat(299));
        let name_a = directory_name(&long_a);
        let name_b = directory_name(&long_b);
        assert!(name_a.len() <= MAX_IDENTITY_LEN);
        assert_ne!(name_a, name_b);
    }
}
