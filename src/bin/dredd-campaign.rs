use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use dredd_campaign::campaign::{
    CampaignConfig, CampaignController, CampaignOutcome, CampaignReport, CompiledProgramHarness,
    Compilers, GeneratorSpec, MutationTree, ReportFormat, SuiteCommands, SuiteHarness,
    TestHarness, TimeoutConfig, WorkDir, render_report,
};

#[derive(Debug, Parser)]
#[command(name = "dredd-campaign")]
#[command(about = "Mutation-testing campaigns for Dredd-instrumented compilers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Test a compiler with freshly generated programs.
    RunGenerator {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[command(flatten)]
        compilers: CompilerArgs,
        /// Generator command; `{seed}` and `{output}` are substituted.
        #[arg(long, allow_hyphen_values = true)]
        generator: String,
        /// Test identity prefix.
        #[arg(long, default_value = "generated")]
        prefix: String,
        /// File name of the generated program.
        #[arg(long, default_value = "prog.c")]
        program_name: String,
    },
    /// Test a compiler with a fixed corpus of programs.
    RunCorpus {
        #[command(flatten)]
        campaign: CampaignArgs,
        #[command(flatten)]
        compilers: CompilerArgs,
        /// Corpus root directory.
        #[arg(long)]
        corpus: PathBuf,
        /// File extensions to include; all files when omitted.
        #[arg(long = "extension")]
        extensions: Vec<String>,
    },
    /// Test a compiler with a test suite of named sub-tests.
    RunSuite {
        #[command(flatten)]
        campaign: CampaignArgs,
        /// File listing one suite query per line.
        #[arg(long)]
        tests: PathBuf,
        /// Suite command against the mutated build; `{test}` is the query.
        #[arg(long, allow_hyphen_values = true)]
        suite_command: String,
        /// Suite command against the tracking build; `{test}` is the query.
        #[arg(long, allow_hyphen_values = true)]
        tracking_suite_command: String,
        /// Test identity prefix.
        #[arg(long, default_value = "")]
        identity_prefix: String,
    },
    /// Check that two mutation-info documents describe the same tree.
    CheckTrees {
        /// Mutation info file of the mutated compiler.
        mutation_info_file: PathBuf,
        /// Mutation info file of the tracking compiler.
        tracking_mutation_info_file: PathBuf,
    },
    /// Summarize a work directory.
    Report {
        /// Work directory.
        #[arg(long, default_value = "work")]
        work_dir: PathBuf,
        /// Output format.
        #[arg(long, value_enum, default_value = "md")]
        format: OutputFormat,
    },
}

#[derive(Debug, Args)]
struct CampaignArgs {
    /// Mutation info file of the mutated compiler.
    mutation_info_file: PathBuf,
    /// Mutation info file of the tracking compiler.
    tracking_mutation_info_file: PathBuf,
    /// Shared work directory.
    #[arg(long, default_value = "work")]
    work_dir: PathBuf,
    /// Mutations enabled together per trial; 1 disables batching.
    #[arg(long, default_value_t = NonZeroUsize::MIN)]
    batch_size: NonZeroUsize,
    /// Seed for program seeds and candidate shuffling.
    #[arg(long)]
    seed: Option<u64>,
    /// Shuffle candidate mutations before batching.
    #[arg(long)]
    shuffle: bool,
    /// Total time budget in seconds; 0 is unlimited.
    #[arg(long)]
    total_time: Option<u64>,
    /// Stop after this many seconds without a kill; 0 is unlimited.
    #[arg(long)]
    max_time_since_last_kill: Option<u64>,
    /// Generator timeout in seconds.
    #[arg(long)]
    generator_timeout: Option<u64>,
    /// Unmutated compile timeout in seconds.
    #[arg(long)]
    compile_timeout: Option<u64>,
    /// Unmutated run timeout in seconds.
    #[arg(long)]
    run_timeout: Option<u64>,
    /// Floor for mutated compile and run timeouts, in seconds.
    #[arg(long)]
    min_mutant_timeout: Option<u64>,
    /// Mutated timeouts as a multiple of the unmutated times.
    #[arg(long)]
    mutant_timeout_multiplier: Option<f64>,
}

#[derive(Debug, Args)]
struct CompilerArgs {
    /// Compiler built with mutations.
    #[arg(long)]
    mutated_compiler: PathBuf,
    /// Compiler built with mutant tracking.
    #[arg(long)]
    tracking_compiler: PathBuf,
    /// Compiler arguments; `{program}` is the test program.
    #[arg(long, allow_hyphen_values = true, default_value = "{program}")]
    compiler_args: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn make_timeouts(args: &CampaignArgs) -> TimeoutConfig {
    let mut timeouts = TimeoutConfig::default();
    if let Some(secs) = args.generator_timeout {
        timeouts.generator_secs = secs;
    }
    if let Some(secs) = args.compile_timeout {
        timeouts.compile_secs = secs;
    }
    if let Some(secs) = args.run_timeout {
        timeouts.run_secs = secs;
    }
    if let Some(secs) = args.min_mutant_timeout {
        timeouts.min_mutant_compile_secs = secs;
        timeouts.min_mutant_run_secs = secs;
    }
    if let Some(multiplier) = args.mutant_timeout_multiplier {
        timeouts.mutant_compile_multiplier = multiplier;
        timeouts.mutant_run_multiplier = multiplier;
    }
    timeouts
}

fn make_config(args: &CampaignArgs) -> CampaignConfig {
    let mut config = CampaignConfig::default()
        .with_work_dir(&args.work_dir)
        .with_batch_size(args.batch_size)
        .with_shuffle_candidates(args.shuffle)
        .with_timeouts(make_timeouts(args));
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    if let Some(secs) = args.total_time {
        config = config.with_total_time_secs(secs);
    }
    if let Some(secs) = args.max_time_since_last_kill {
        config = config.with_max_idle_secs(secs);
    }
    config
}

fn make_compilers(args: CompilerArgs) -> Compilers {
    Compilers {
        mutated: args.mutated_compiler,
        tracking: args.tracking_compiler,
        args: split_command(&args.compiler_args),
    }
}

fn run_campaign<H: TestHarness>(config: CampaignConfig, args: &CampaignArgs, harness: H) -> Result<()> {
    let mut controller = CampaignController::from_paths(
        config,
        &args.mutation_info_file,
        &args.tracking_mutation_info_file,
        harness,
    )?;
    let outcome: CampaignOutcome = controller.run()?;
    println!("work dir: {}", controller.work_dir().root().display());
    println!(
        "summary: tests_run={}, skipped={}, unusable={}, failed={}, kills={}",
        outcome.tests_run,
        outcome.tests_skipped,
        outcome.tests_unusable,
        outcome.tests_failed,
        outcome.kills_recorded
    );
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::RunGenerator {
            campaign,
            compilers,
            generator,
            prefix,
            program_name,
        } => {
            let config = make_config(&campaign);
            let harness = CompiledProgramHarness::generator(
                GeneratorSpec {
                    command: split_command(&generator),
                    prefix,
                    file_name: program_name,
                },
                make_compilers(compilers),
                config.timeouts.clone(),
                config.rng(),
            )?;
            run_campaign(config, &campaign, harness)?;
        }
        Command::RunCorpus {
            campaign,
            compilers,
            corpus,
            extensions,
        } => {
            if !corpus.is_dir() {
                bail!("corpus {} is not a directory", corpus.display());
            }
            let config = make_config(&campaign);
            let harness = CompiledProgramHarness::corpus(
                corpus,
                &extensions,
                make_compilers(compilers),
                config.timeouts.clone(),
            )?;
            run_campaign(config, &campaign, harness)?;
        }
        Command::RunSuite {
            campaign,
            tests,
            suite_command,
            tracking_suite_command,
            identity_prefix,
        } => {
            let config = make_config(&campaign);
            let queries = SuiteHarness::read_test_list(&tests)
                .with_context(|| format!("reading test list {}", tests.display()))?;
            let harness = SuiteHarness::new(
                queries,
                SuiteCommands {
                    mutated: split_command(&suite_command),
                    tracking: split_command(&tracking_suite_command),
                },
                identity_prefix,
                config.timeouts.clone(),
            )?;
            run_campaign(config, &campaign, harness)?;
        }
        Command::CheckTrees {
            mutation_info_file,
            tracking_mutation_info_file,
        } => {
            let tree = MutationTree::from_path(&mutation_info_file)?;
            let tracking = MutationTree::from_path(&tracking_mutation_info_file)?;
            tree.ensure_matches(&tracking)?;
            println!("mutation trees match: {} mutations", tree.num_mutations());
        }
        Command::Report { work_dir, format } => {
            if !work_dir.is_dir() {
                bail!("work directory {} does not exist", work_dir.display());
            }
            let work = WorkDir::open(&work_dir)?;
            let report = CampaignReport::scan(&work)?;
            let format = match format {
                OutputFormat::Md => ReportFormat::Markdown,
                OutputFormat::Json => ReportFormat::Json,
            };
            println!("{}", render_report(&report, format)?);
        }
    }

    Ok(())
}
