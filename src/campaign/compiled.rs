//! Harness for test programs that are compiled and then executed.
//!
//! Programs come either from a generator command run with a fresh seed per
//! test, or from a fixed corpus of source files.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::classifier::{BinaryBaseline, classify_binary, hash_file};
use super::config::TimeoutConfig;
use super::dredd::{ENABLED_MUTATION_VAR, mutant_env, read_tracking_file, tracking_env};
use super::harness::{
    HarnessError, TestCase, TestHarness, expand_template, remove_if_exists, template_uses,
};
use super::process::{CommandSpec, ProcessOutcome, ProcessRunner};
use super::tree::MutationId;
use super::verdict::BinaryVerdict;

const REGULAR_EXE: &str = "__regular.exe";
const TRACKING_EXE: &str = "__tracking.exe";
const MUTANT_EXE: &str = "__mutant.exe";
const TRACKING_FILE: &str = "__dredd_covered_mutants";

/// Mutated and tracking compilers plus the arguments used for every compile.
#[derive(Debug, Clone)]
pub struct Compilers {
    /// Compiler build carrying the mutations.
    pub mutated: PathBuf,
    /// Compiler build that reports covered mutations.
    pub tracking: PathBuf,
    /// Argument template; `{program}` is the test program. `-o <exe>` is
    /// appended automatically.
    pub args: Vec<String>,
}

/// Generator settings.
#[derive(Debug, Clone)]
pub struct GeneratorSpec {
    /// Argument template using `{seed}` and `{output}`.
    pub command: Vec<String>,
    /// Test identity prefix; identities are `<prefix>_<seed>`.
    pub prefix: String,
    /// File name of the generated program.
    pub file_name: String,
}

enum ProgramSource {
    Generator {
        spec: GeneratorSpec,
        rng: fastrand::Rng,
    },
    Corpus {
        root: PathBuf,
        queue: VecDeque<PathBuf>,
    },
}

/// Compiled-program harness judged by [`BinaryVerdict`].
pub struct CompiledProgramHarness {
    source: ProgramSource,
    compilers: Compilers,
    timeouts: TimeoutConfig,
    runner: ProcessRunner,
    scratch: TempDir,
}

impl CompiledProgramHarness {
    /// Harness generating a fresh program per test.
    pub fn generator(
        spec: GeneratorSpec,
        compilers: Compilers,
        timeouts: TimeoutConfig,
        rng: fastrand::Rng,
    ) -> Result<Self, HarnessError> {
        for placeholder in ["seed", "output"] {
            if !template_uses(&spec.command, placeholder) {
                return Err(HarnessError::Config(format!(
                    "generator command must use {{{placeholder}}}"
                )));
            }
        }
        Self::build(ProgramSource::Generator { spec, rng }, compilers, timeouts)
    }

    /// Harness walking the files under `root` whose extension is listed in
    /// `extensions` (all files when empty), in sorted order.
    pub fn corpus(
        root: impl Into<PathBuf>,
        extensions: &[String],
        compilers: Compilers,
        timeouts: TimeoutConfig,
    ) -> Result<Self, HarnessError> {
        let root = root.into();
        let mut files = Vec::new();
        collect_files(&root, extensions, &mut files)?;
        files.sort();
        info!(count = files.len(), root = %root.display(), "loaded test corpus");
        Self::build(
            ProgramSource::Corpus {
                root,
                queue: files.into(),
            },
            compilers,
            timeouts,
        )
    }

    fn build(
        source: ProgramSource,
        compilers: Compilers,
        timeouts: TimeoutConfig,
    ) -> Result<Self, HarnessError> {
        if !template_uses(&compilers.args, "program") {
            return Err(HarnessError::Config(
                "compiler arguments must use {program}".to_string(),
            ));
        }
        let scratch = tempfile::tempdir().map_err(|source| HarnessError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        Ok(Self {
            source,
            compilers,
            timeouts,
            runner: ProcessRunner::new(),
            scratch,
        })
    }

    fn scratch(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    fn compile_command(&self, compiler: &Path, program: &Path, exe: &Path) -> CommandSpec {
        let program = program.display().to_string();
        CommandSpec::new(compiler)
            .args(expand_template(&self.compilers.args, &[("program", &program)]))
            .arg("-o")
            .arg(exe)
    }

    /// Produce the program for `test`; `false` if generation failed.
    fn materialize(&self, test: &TestCase) -> Result<bool, HarnessError> {
        let ProgramSource::Generator { spec, .. } = &self.source else {
            return Ok(true);
        };
        let (Some(seed), Some(output)) = (test.seed, test.artifact.as_deref()) else {
            return Err(HarnessError::Config(format!(
                "generated test {} has no seed or output path",
                test.identity
            )));
        };
        remove_if_exists(output)?;
        let seed = seed.to_string();
        let output_arg = output.display().to_string();
        let argv = expand_template(&spec.command, &[("seed", &seed), ("output", &output_arg)]);
        let command = CommandSpec::from_argv(argv)
            .ok_or_else(|| HarnessError::Config("generator command is empty".to_string()))?;

        match self.runner.run(&command, self.timeouts.generator(), NO_ENV)? {
            ProcessOutcome::TimedOut => {
                info!(%seed, "generator timed out");
                Ok(false)
            }
            ProcessOutcome::Completed(record) if !record.success() || !output.is_file() => {
                info!(%seed, exit_code = record.exit_code, "generator failed");
                Ok(false)
            }
            ProcessOutcome::Completed(_) => Ok(true),
        }
    }

    fn program_path<'a>(&self, test: &'a TestCase) -> Result<&'a Path, HarnessError> {
        test.artifact.as_deref().ok_or_else(|| {
            HarnessError::Config(format!("test {} has no program file", test.identity))
        })
    }
}

const NO_ENV: &[(&str, &str)] = &[];

fn unmutated_env() -> [(&'static str, &'static str); 1] {
    [(ENABLED_MUTATION_VAR, "")]
}

fn hash(path: &Path) -> Result<String, HarnessError> {
    hash_file(path).map_err(|source| HarnessError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl TestHarness for CompiledProgramHarness {
    type Baseline = BinaryBaseline;
    type Verdict = BinaryVerdict;

    fn next_test(&mut self) -> Result<Option<TestCase>, HarnessError> {
        let scratch = self.scratch.path().to_path_buf();
        match &mut self.source {
            ProgramSource::Generator { spec, rng } => {
                let seed = u64::from(rng.u32(..));
                Ok(Some(
                    TestCase::new(format!("{}_{seed}", spec.prefix))
                        .with_seed(seed)
                        .with_artifact(scratch.join(&spec.file_name)),
                ))
            }
            ProgramSource::Corpus { root, queue } => Ok(queue.pop_front().map(|file| {
                let identity = file
                    .strip_prefix(root.as_path())
                    .unwrap_or(&file)
                    .display()
                    .to_string();
                TestCase::new(identity).with_artifact(file)
            })),
        }
    }

    fn claim_before_baseline(&self) -> bool {
        matches!(self.source, ProgramSource::Corpus { .. })
    }

    fn baseline(&mut self, test: &TestCase) -> Result<Option<BinaryBaseline>, HarnessError> {
        if !self.materialize(test)? {
            return Ok(None);
        }
        let program = self.program_path(test)?;
        let exe = self.scratch(REGULAR_EXE);
        remove_if_exists(&exe)?;

        let compile = self.compile_command(&self.compilers.mutated, program, &exe);
        let compile = match self.runner.run(&compile, self.timeouts.compile(), &unmutated_env())? {
            ProcessOutcome::TimedOut => {
                info!(test = %test.identity, "compile timed out without mutants");
                return Ok(None);
            }
            ProcessOutcome::Completed(record) if !record.success() => {
                info!(
                    test = %test.identity,
                    stderr = %String::from_utf8_lossy(&record.stderr),
                    "compilation failed without mutants"
                );
                return Ok(None);
            }
            ProcessOutcome::Completed(record) => record,
        };
        let binary_hash = hash(&exe)?;

        let execution = match self.runner.run(&CommandSpec::new(&exe), self.timeouts.run(), NO_ENV)? {
            ProcessOutcome::TimedOut => {
                info!(test = %test.identity, "program timed out without mutants");
                return Ok(None);
            }
            ProcessOutcome::Completed(record) if !record.success() => {
                info!(test = %test.identity, exit_code = record.exit_code, "program failed without mutants");
                return Ok(None);
            }
            ProcessOutcome::Completed(record) => record,
        };

        Ok(Some(BinaryBaseline {
            binary_hash,
            compile,
            execution,
        }))
    }

    fn covered_mutants(
        &mut self,
        test: &TestCase,
        baseline: &BinaryBaseline,
    ) -> Result<Option<BTreeSet<MutationId>>, HarnessError> {
        let program = self.program_path(test)?;
        let exe = self.scratch(TRACKING_EXE);
        let tracking_file = self.scratch(TRACKING_FILE);
        remove_if_exists(&exe)?;
        remove_if_exists(&tracking_file)?;

        let mut env = tracking_env(&tracking_file);
        env.push((ENABLED_MUTATION_VAR, String::new()));
        let compile = self.compile_command(&self.compilers.tracking, program, &exe);
        match self.runner.run(&compile, self.timeouts.compile(), &env)? {
            ProcessOutcome::TimedOut => {
                info!(test = %test.identity, "mutant tracking compilation timed out");
                return Ok(None);
            }
            ProcessOutcome::Completed(record) if !record.success() => {
                info!(test = %test.identity, "mutant tracking compilation failed");
                return Ok(None);
            }
            ProcessOutcome::Completed(_) => {}
        }
        if hash(&exe)? != baseline.binary_hash {
            warn!(
                test = %test.identity,
                "tracking build produced a different executable than the unmutated build"
            );
            return Ok(None);
        }

        Ok(Some(read_tracking_file(&tracking_file)?))
    }

    fn run_mutants(
        &mut self,
        test: &TestCase,
        baseline: &BinaryBaseline,
        mutants: &[MutationId],
    ) -> Result<BinaryVerdict, HarnessError> {
        let program = self.program_path(test)?;
        let exe = self.scratch(MUTANT_EXE);
        remove_if_exists(&exe)?;

        let compile = self.compile_command(&self.compilers.mutated, program, &exe);
        let compile_timeout = self.timeouts.mutant_compile(baseline.compile.elapsed);
        let run_timeout = self.timeouts.mutant_run(baseline.execution.elapsed);
        let compiled = self.runner.run(&compile, compile_timeout, &mutant_env(mutants))?;

        let verdict = classify_binary(
            baseline,
            &compiled,
            || hash(&exe),
            || Ok(self.runner.run(&CommandSpec::new(&exe), run_timeout, NO_ENV)?),
        )?;
        debug!(test = %test.identity, ?mutants, %verdict, "mutant run judged");
        Ok(verdict)
    }
}

fn collect_files(dir: &Path, extensions: &[String], out: &mut Vec<PathBuf>) -> Result<(), HarnessError> {
    let io = |source| HarnessError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        if path.is_dir() {
            collect_files(&path, extensions, out)?;
        } else if extensions.is_empty()
            || path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|wanted| wanted == ext))
        {
            out.push(path);
        }
    }
    Ok(())
}
