#![cfg(all(feature = "cli", any(target_os = "linux", target_os = "macos")))]

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tempfile::tempdir;

/// Copies the program to the output; mutation 1 changes stdout, mutation 2
/// crashes, mutation 0 is reached but changes nothing.
const FAKE_CC: &[u8] = br#"#!/usr/bin/env sh
prog="$1"
out="$3"
if [ -n "$DREDD_MUTANT_TRACKING_FILE" ]; then
  printf '0\n1\n2\n' > "$DREDD_MUTANT_TRACKING_FILE"
fi
case ",$DREDD_ENABLED_MUTATION," in
  *,2,*) echo "internal compiler error" >&2; exit 1 ;;
  *,1,*) printf '#!/bin/sh\necho 43\n' > "$out" ;;
  *) cat "$prog" > "$out" ;;
esac
chmod +x "$out"
"#;

const FAKE_GENERATOR: &[u8] = br#"#!/usr/bin/env sh
printf '#!/bin/sh\necho %s\n' "$1" > "$2"
"#;

fn write_script(dir: &Path, name: &str, body: &[u8]) -> PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).expect("script should be created");
    file.write_all(body).expect("script should be written");
    file.sync_all().expect("script should be flushed");
    fs::set_permissions(&path, PermissionsExt::from_mode(0o755))
        .expect("script should be executable");
    path
}

fn write_tree(path: &Path, parent: serde_json::Value) {
    let doc = serde_json::json!({
        "mutation_to_node": {"0": 0, "1": 1, "2": 2},
        "parent": parent,
        "num_nodes": 3,
        "num_mutations": 3,
    });
    fs::write(path, doc.to_string()).expect("mutation info should be written");
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    cc: PathBuf,
    info: PathBuf,
    tracking_info: PathBuf,
    work: PathBuf,
}

fn fixture() -> Fixture {
    let tmp = tempdir().expect("tempdir should be created");
    let root = tmp.path().to_path_buf();
    let cc = write_script(&root, "fakecc", FAKE_CC);
    let info = root.join("info.json");
    let tracking_info = root.join("tracking-info.json");
    write_tree(&info, serde_json::json!({}));
    write_tree(&tracking_info, serde_json::json!({}));
    Fixture {
        work: root.join("work"),
        _tmp: tmp,
        root,
        cc,
        info,
        tracking_info,
    }
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("path should be valid utf-8")
}

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dredd-campaign"))
        .args(args)
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("cli command should run")
}

fn outcome_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .find(|line| line.starts_with('{'))
        .expect("output should include the outcome json");
    serde_json::from_str(line).expect("outcome should be json")
}

fn corpus_args<'a>(fx: &'a Fixture, corpus: &'a Path) -> Vec<&'a str> {
    vec![
        "run-corpus",
        path_arg(&fx.info),
        path_arg(&fx.tracking_info),
        "--work-dir",
        path_arg(&fx.work),
        "--mutated-compiler",
        path_arg(&fx.cc),
        "--tracking-compiler",
        path_arg(&fx.cc),
        "--total-time",
        "0",
        "--max-time-since-last-kill",
        "0",
        "--corpus",
        path_arg(corpus),
        "--extension",
        "sh",
    ]
}

#[test]
fn e2e_corpus_campaign_records_kills_once_and_resumes() {
    let fx = fixture();
    let corpus = fx.root.join("corpus");
    fs::create_dir_all(&corpus).expect("corpus should be created");
    fs::write(corpus.join("a.sh"), "#!/bin/sh\necho 42\n").expect("program should be written");
    fs::write(corpus.join("b.sh"), "#!/bin/sh\necho 7\n").expect("program should be written");

    let output = run_cli(&corpus_args(&fx, &corpus));
    assert!(
        output.status.success(),
        "campaign should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let outcome = outcome_json(&output);
    assert_eq!(outcome["stop_reason"], "source_exhausted");
    assert_eq!(outcome["tests_run"], 2);
    assert_eq!(outcome["kills_recorded"], 2);

    let first: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.work.join("tests/a.sh/kill_summary.json"))
            .expect("first summary should exist"),
    )
    .expect("summary should be json");
    assert_eq!(first["covered_mutants"], serde_json::json!([0, 1, 2]));
    assert_eq!(first["killed_mutants"], serde_json::json!([1, 2]));
    assert_eq!(first["survived_mutants"], serde_json::json!([0]));
    assert_eq!(first["terminated_early"], false);
    assert!(fx.work.join("tests/a.sh/a.sh").is_file());

    let second: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.work.join("tests/b.sh/kill_summary.json"))
            .expect("second summary should exist"),
    )
    .expect("summary should be json");
    assert_eq!(second["skipped_mutants"], serde_json::json!([1, 2]));
    assert_eq!(second["killed_mutants"], serde_json::json!([]));

    let kill: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.work.join("killed_mutants/2/kill_info.json"))
            .expect("kill info should exist"),
    )
    .expect("kill info should be json");
    assert_eq!(kill["killing_test"], "a.sh");
    assert_eq!(kill["kill_type"], "KILL_COMPILER_CRASH");

    let resumed = run_cli(&corpus_args(&fx, &corpus));
    assert!(resumed.status.success(), "resumed campaign should succeed");
    let outcome = outcome_json(&resumed);
    assert_eq!(outcome["tests_run"], 0);
    assert_eq!(outcome["tests_skipped"], 2);
    assert_eq!(outcome["kills_recorded"], 0);

    let report = run_cli(&["report", "--work-dir", path_arg(&fx.work), "--format", "json"]);
    assert!(report.status.success(), "report should succeed");
    let report: serde_json::Value =
        serde_json::from_slice(&report.stdout).expect("report should be json");
    assert_eq!(report["killed_mutants"], 2);
    assert_eq!(report["kills_by_type"]["KILL_DIFFERENT_STDOUT"], 1);
    assert_eq!(report["reduction_queue"][0]["mutation"], 1);

    let markdown = run_cli(&["report", "--work-dir", path_arg(&fx.work)]);
    let markdown = String::from_utf8_lossy(&markdown.stdout);
    assert!(markdown.contains("| KILL_COMPILER_CRASH | 1 |"));
}

#[test]
fn e2e_generator_campaign_stops_on_budget() {
    let fx = fixture();
    let generator = write_script(&fx.root, "fakegen", FAKE_GENERATOR);
    let generator_command = format!("{} {{seed}} {{output}}", generator.display());

    let output = run_cli(&[
        "run-generator",
        path_arg(&fx.info),
        path_arg(&fx.tracking_info),
        "--work-dir",
        path_arg(&fx.work),
        "--mutated-compiler",
        path_arg(&fx.cc),
        "--tracking-compiler",
        path_arg(&fx.cc),
        "--generator",
        &generator_command,
        "--prefix",
        "fakegen",
        "--program-name",
        "prog.sh",
        "--seed",
        "5",
        "--total-time",
        "1",
    ]);
    assert!(
        output.status.success(),
        "campaign should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let outcome = outcome_json(&output);
    assert_eq!(outcome["stop_reason"], "budget_exhausted");

    let tests: Vec<String> = fs::read_dir(fx.work.join("tests"))
        .expect("tests dir should exist")
        .map(|entry| {
            entry
                .expect("entry should be readable")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    assert!(!tests.is_empty());
    assert!(tests.iter().all(|name| name.starts_with("fakegen_")));
    assert!(fx.work.join("killed_mutants/1/kill_info.json").is_file());
}

#[test]
fn e2e_check_trees_detects_mismatch() {
    let fx = fixture();
    let ok = run_cli(&["check-trees", path_arg(&fx.info), path_arg(&fx.tracking_info)]);
    assert!(ok.status.success());
    assert!(String::from_utf8_lossy(&ok.stdout).contains("3 mutations"));

    write_tree(&fx.tracking_info, serde_json::json!({"1": 0}));
    let mismatch = run_cli(&["check-trees", path_arg(&fx.info), path_arg(&fx.tracking_info)]);
    assert!(!mismatch.status.success());
    assert!(String::from_utf8_lossy(&mismatch.stderr).contains("parent"));
}

#[test]
fn e2e_same_tree_file_twice_is_rejected() {
    let fx = fixture();
    let corpus = fx.root.join("corpus");
    fs::create_dir_all(&corpus).expect("corpus should be created");

    let mut args = corpus_args(&fx, &corpus);
    args[2] = path_arg(&fx.info);
    let output = run_cli(&args);
    assert!(!output.status.success());
    assert!(!fx.work.join("tests").exists());
}
