//! CLI smoke tests through the built `mtb` binary.

mod common;

use std::fs;
use std::path::Path;

use serde_json::Value;

fn write_config(dir: &Path) -> String {
    let path = dir.join("mtb.toml");
    let journal = dir.join("runs.jsonl");
    fs::write(
        &path,
        format!(
            r#"
[environment]
shell = "sh"
testbed_script = "{}"

[capture]
analyzer = "true"
use_sudo = false

[run]
cooldown = false
poll_interval_ms = 10

[paths]
journal = "{}"
"#,
            dir.join("missing-testbed.sh").display(),
            journal.display()
        ),
    )
    .unwrap();
    path.display().to_string()
}

fn write_plan(dir: &Path, rtts: &str) -> String {
    let path = dir.join("plan.toml");
    fs::write(
        &path,
        format!(
            r#"
folder = "{}"
title = "Sweep"

[[steps]]
kind = "rtt"
values = [{rtts}]

[leaf]
traffic = ["true {{port}}"]
"#,
            dir.join("results").display()
        ),
    )
    .unwrap();
    path.display().to_string()
}

fn json_line(stdout: &str) -> Value {
    let line = stdout.lines().last().unwrap_or_default();
    serde_json::from_str(line).unwrap_or(Value::Null)
}

fn write_tree(root: &Path) {
    let meta = |folder: &Path, lines: &[&str]| {
        fs::create_dir_all(folder).unwrap();
        fs::write(folder.join("details"), format!("{}\n", lines.join("\n"))).unwrap();
    };
    meta(root, &["type collection", "title Plot", "sub sched-a", "sub sched-b"]);
    for (sched, title) in [("sched-a", "A"), ("sched-b", "B")] {
        let folder = root.join(sched);
        meta(
            &folder,
            &["type collection", &format!("title {title}"), "titlelabel Scheduler", "sub rtt-10", "sub rtt-50"],
        );
        for (rtt, rtt_title) in [("rtt-10", "10"), ("rtt-50", "50")] {
            meta(
                &folder.join(rtt),
                &["type collection", &format!("title {rtt_title}"), "titlelabel RTT", "sub test"],
            );
            meta(&folder.join(rtt).join("test"), &["type test", "data_collected"]);
        }
    }
}

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: mtb [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn subcommands_have_help() {
    for subcmd in ["run", "estimate", "tree", "index", "retest", "version", "completions"] {
        let case_name = format!("subcommand_{subcmd}_help");
        let result = common::run_cli_case(&case_name, &[subcmd, "--help"]);
        assert!(
            result.status.success(),
            "subcommand '{subcmd} --help' failed; log: {}",
            result.log_path.display()
        );
        assert!(
            result.stdout.contains("Usage"),
            "subcommand '{subcmd} --help' missing usage info; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn version_json_names_binary() {
    let result = common::run_cli_case("version_json_names_binary", &["version", "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["binary"], "mtb", "log: {}", result.log_path.display());
}

#[test]
fn completions_command_generates_shell_script() {
    let result = common::run_cli_case(
        "completions_command_generates_shell_script",
        &["completions", "bash"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(
        result.stdout.contains("mtb"),
        "expected completion script contents; log: {}",
        result.log_path.display()
    );
}

#[test]
fn estimate_counts_tests_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let plan = write_plan(dir.path(), "10, 50, 100");
    let result = common::run_cli_case(
        "estimate_counts_tests_without_side_effects",
        &["--config", &config, "estimate", &plan, "--json"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["summary"]["total"], 3, "log: {}", result.log_path.display());
    assert_eq!(payload["summary"]["will_run"], 3);
    assert!(!dir.path().join("results").exists());
}

#[test]
fn duplicate_tag_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let plan = write_plan(dir.path(), "10, 10");
    let result = common::run_cli_case(
        "duplicate_tag_is_a_user_error",
        &["--config", &config, "estimate", &plan],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("MTB-1101"), "log: {}", result.log_path.display());
}

#[test]
fn run_without_terminal_needs_yes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let plan = write_plan(dir.path(), "10");
    let result = common::run_cli_case(
        "run_without_terminal_needs_yes",
        &["--config", &config, "run", &plan, "--json"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert_eq!(json_line(&result.stdout)["status"], "declined");
    assert!(!dir.path().join("results").exists());
}

#[test]
fn run_with_broken_testbed_records_failures_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let plan = write_plan(dir.path(), "10, 50");
    let result = common::run_cli_case(
        "run_with_broken_testbed_records_failures_only",
        &["--config", &config, "run", &plan, "--yes", "--json"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    assert_eq!(payload["report"]["failed"], 2, "log: {}", result.log_path.display());
    assert_eq!(payload["report"]["collected"], 0);

    let results = dir.path().join("results");
    assert!(!results.join("details").exists());
    assert!(!results.join("rtt-10").join("details").exists());

    let journal = fs::read_to_string(dir.path().join("runs.jsonl")).unwrap();
    assert!(journal.contains("\"environment_error\""));
    assert!(journal.contains("\"walk_complete\""));
}

#[test]
fn tree_reorders_levels() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("results");
    write_tree(&root);
    let root_arg = root.display().to_string();
    let result = common::run_cli_case(
        "tree_reorders_levels",
        &["tree", &root_arg, "--order", "1,0", "--json"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_line(&result.stdout);
    let outer: Vec<&str> = payload["tree"]["children"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["title"].as_str().unwrap())
        .collect();
    assert_eq!(outer, ["10", "50"], "log: {}", result.log_path.display());
}

#[test]
fn tree_rejects_out_of_range_level() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("results");
    write_tree(&root);
    let root_arg = root.display().to_string();
    let result = common::run_cli_case(
        "tree_rejects_out_of_range_level",
        &["tree", &root_arg, "--order", "5"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
}

#[test]
fn index_writes_html() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("results");
    write_tree(&root);
    let root_arg = root.display().to_string();
    let result = common::run_cli_case("index_writes_html", &["index", &root_arg]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let html = fs::read_to_string(root.join("index.html")).unwrap();
    assert!(html.contains("Scheduler: <b>A</b>"));
}

#[test]
fn retest_clears_marker() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("results");
    write_tree(&root);
    let test = root.join("sched-a/rtt-10/test");
    let test_arg = test.display().to_string();
    let result = common::run_cli_case("retest_clears_marker", &["retest", &test_arg, "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert_eq!(json_line(&result.stdout)["had_data"], true);
    let details = fs::read_to_string(test.join("details")).unwrap();
    assert!(!details.contains("data_collected"));
}
