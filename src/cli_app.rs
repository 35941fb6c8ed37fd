//! Top-level CLI definition and dispatch.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use matrix_testbed::core::config::Config;
use matrix_testbed::core::errors::MtbError;
use matrix_testbed::core::paths::resolve_absolute_path;
use matrix_testbed::logger::{init_tracing, open_journal};
use matrix_testbed::process::context::{EXIT_CANCELLED, OrchestratorContext, SignalWatcher};
use matrix_testbed::process::launcher::{Launcher, ShellLauncher, TmuxLauncher};
use matrix_testbed::runner::plan::PlanFile;
use matrix_testbed::runner::runtime::{RunOptions, Runtime};
use matrix_testbed::runner::testcase::retest;
use matrix_testbed::runner::walker::{DryRunSummary, TestPlan, WalkReport, Walker};
use matrix_testbed::testbed::capture::{Analysis, CommandAnalysis};
use matrix_testbed::testbed::environment::ShellEnvironment;
use matrix_testbed::tree::node::{CollectionNode, Node, build_html_index};
use matrix_testbed::tree::permute::reorder_levels;

/// Matrix testbed — runs declarative test matrices on an AQM testbed.
#[derive(Debug, Parser)]
#[command(
    name = "mtb",
    author,
    version,
    about = "Matrix Testbed - declarative AQM test-matrix runner",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Estimate, confirm, then run every test of a plan.
    Run(RunArgs),
    /// Dry pass only: count and time the tests a run would execute.
    Estimate(PlanArgs),
    /// Print a result tree, optionally regrouped.
    Tree(TreeArgs),
    /// Write index.html for a result tree.
    Index(TreeArgs),
    /// Mark tests to be repeated by the next run.
    Retest(RetestArgs),
    /// Show version and optional build metadata.
    Version(VersionArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct PlanArgs {
    /// Plan file (TOML).
    #[arg(value_name = "PLAN")]
    plan: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    #[command(flatten)]
    plan: PlanArgs,
    /// Start without asking for confirmation.
    #[arg(short = 'y', long)]
    yes: bool,
    /// Repeat tests that already collected data.
    #[arg(long)]
    retest: bool,
    /// Analyze again tests that were already analyzed.
    #[arg(long)]
    reanalyze: bool,
    /// Show capture and monitors in tmux panes.
    #[arg(long)]
    interactive: bool,
}

#[derive(Debug, Clone, Args)]
struct TreeArgs {
    /// Root collection folder.
    #[arg(value_name = "FOLDER")]
    folder: PathBuf,
    /// New level order, e.g. `1,0` swaps the two outermost levels.
    #[arg(long, value_delimiter = ',', value_name = "LEVELS")]
    order: Vec<usize>,
}

#[derive(Debug, Clone, Args)]
struct RetestArgs {
    /// Test folders (containing `type test` metadata).
    #[arg(value_name = "TEST_FOLDER", required = true)]
    folders: Vec<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct VersionArgs {
    /// Include build metadata.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input: config, plan or arguments.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// The run was interrupted.
    #[error("run cancelled")]
    Cancelled,
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Cancelled => EXIT_CANCELLED,
        }
    }
}

impl From<MtbError> for CliError {
    fn from(err: MtbError) -> Self {
        match err {
            MtbError::Cancelled => Self::Cancelled,
            MtbError::InvalidConfig { .. }
            | MtbError::MissingConfig { .. }
            | MtbError::ConfigParse { .. }
            | MtbError::Configuration { .. }
            | MtbError::Metadata { .. } => Self::User(err.to_string()),
            MtbError::Serialization { .. } => Self::Internal(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Run(args) => run_plan(cli, args),
        Command::Estimate(args) => run_estimate(cli, args),
        Command::Tree(args) => run_tree(cli, args),
        Command::Index(args) => run_index(cli, args),
        Command::Retest(args) => run_retest(cli, args),
        Command::Version(args) => emit_version(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── setup ────────────────────

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    } else if cli.quiet {
        config.logging.level = "error".to_string();
    }
    init_tracing(&config.logging);
    Ok(config)
}

fn load_plan(path: &Path, config: &Config) -> Result<TestPlan, CliError> {
    let mut plan = PlanFile::load(path)?.compile(&config.testbed)?;
    plan.folder = resolve_absolute_path(&plan.folder);
    tracing::debug!(
        plan = %path.display(),
        folder = %plan.folder.display(),
        steps = plan.steps.len(),
        "plan compiled"
    );
    Ok(plan)
}

fn make_launcher(config: &Config) -> Result<Box<dyn Launcher>, CliError> {
    if config.run.interactive {
        Ok(Box::new(TmuxLauncher::from_env()?))
    } else {
        Ok(Box::new(ShellLauncher::new(config.environment.shell.clone())))
    }
}

// ──────────────────── run / estimate ────────────────────

fn run_plan(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    config.run.retest |= args.retest;
    config.run.reanalyze |= args.reanalyze;
    config.run.interactive |= args.interactive;
    if args.yes {
        config.run.ask_confirmation = false;
    }
    let plan = load_plan(&args.plan.plan, &config)?;
    let mode = output_mode(cli);

    let ctx = Arc::new(OrchestratorContext::new());
    let _watcher = SignalWatcher::install(Arc::clone(&ctx), config.run.poll_interval(), || {
        eprintln!("mtb: aborted");
    })?;
    let launcher = make_launcher(&config)?;
    let environment = ShellEnvironment::new(
        config.environment.shell.clone(),
        config.environment.testbed_script.clone(),
    );
    let analysis = CommandAnalysis::from_config(&config.environment.shell, &config.analysis);
    let rt = Runtime {
        ctx: &ctx,
        environment: &environment,
        launcher: launcher.as_ref(),
        capture: &config.capture,
        analysis: analysis.as_ref().map(|a| a as &dyn Analysis),
        options: RunOptions::from_config(&config.run),
    };
    let mut walker = Walker::new(rt).with_journal(open_journal(&config));

    let mut confirm = |summary: &DryRunSummary| confirm_start(summary);
    match walker.run_plan(&plan, &mut confirm)? {
        Some(report) => emit_report(mode, &plan, &report),
        None => match mode {
            OutputMode::Human => {
                println!("Aborted before starting any test.");
                Ok(())
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "run",
                "status": "declined",
            })),
        },
    }
}

fn confirm_start(summary: &DryRunSummary) -> bool {
    if !io::stdin().is_terminal() {
        eprintln!("mtb: stdin is not a terminal; pass --yes to start without confirmation");
        return false;
    }
    eprint!(
        "Run {} tests ({} skipped), estimated {}? [y/N] ",
        summary.will_run,
        summary.skipped,
        format_secs(summary.estimated.as_secs())
    );
    let _ = io::stderr().flush();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn emit_report(mode: OutputMode, plan: &TestPlan, report: &WalkReport) -> Result<(), CliError> {
    match mode {
        OutputMode::Human => {
            println!("{} {}", "Results in".bold(), plan.folder.display());
            println!("  collected: {}", report.collected.to_string().green());
            println!("  reused:    {}", report.reused);
            println!("  skipped:   {}", report.skipped);
            if report.failed > 0 {
                println!("  failed:    {}", report.failed.to_string().red());
            } else {
                println!("  failed:    0");
            }
            println!("  analyzed:  {}", report.analyzed);
            Ok(())
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "run",
            "status": "complete",
            "folder": plan.folder,
            "report": serde_json::to_value(report)?,
        })),
    }
}

fn run_estimate(cli: &Cli, args: &PlanArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let plan = load_plan(&args.plan, &config)?;
    let ctx = OrchestratorContext::new();
    let launcher = ShellLauncher::new(config.environment.shell.clone());
    let environment = ShellEnvironment::new(
        config.environment.shell.clone(),
        config.environment.testbed_script.clone(),
    );
    let rt = Runtime {
        ctx: &ctx,
        environment: &environment,
        launcher: &launcher,
        capture: &config.capture,
        analysis: None,
        options: RunOptions::from_config(&config.run),
    };
    let summary = Walker::new(rt).estimate(&plan)?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!("{} {}", "Plan".bold(), args.plan.display());
            for test in &summary.tests {
                println!("  {}", test.display());
            }
            println!(
                "{} will run, {} skipped, {} total",
                summary.will_run.to_string().green(),
                summary.skipped,
                summary.total
            );
            println!(
                "Estimated time: {} ({} per test)",
                format_secs(summary.estimated.as_secs()),
                format_secs(summary.average().as_secs())
            );
            Ok(())
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "estimate",
            "plan": args.plan,
            "summary": serde_json::to_value(&summary)?,
        })),
    }
}

// ──────────────────── tree tooling ────────────────────

fn load_tree(args: &TreeArgs) -> Result<CollectionNode, CliError> {
    let tree = CollectionNode::load(&args.folder)?;
    Ok(reorder_levels(tree, &args.order)?)
}

fn run_tree(cli: &Cli, args: &TreeArgs) -> Result<(), CliError> {
    let _config = load_config(cli)?;
    let tree = load_tree(args)?;
    match output_mode(cli) {
        OutputMode::Human => {
            print_collection(&tree, 0);
            Ok(())
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "tree",
            "folder": args.folder,
            "order": args.order,
            "tree": serde_json::to_value(&tree)?,
        })),
    }
}

fn print_collection(node: &CollectionNode, depth: usize) {
    let indent = "  ".repeat(depth);
    let label = if node.titlelabel.is_empty() {
        String::new()
    } else {
        format!("{}: ", node.titlelabel)
    };
    println!("{indent}{label}{}", node.title.bold());
    for child in &node.children {
        match child {
            Node::Collection(c) => print_collection(c, depth + 1),
            Node::Leaf(leaf) => println!("{indent}  {}", leaf.testcase.display().to_string().dimmed()),
        }
    }
}

fn run_index(cli: &Cli, args: &TreeArgs) -> Result<(), CliError> {
    let _config = load_config(cli)?;
    let tree = load_tree(args)?;
    let path = args.folder.join("index.html");
    std::fs::write(&path, build_html_index(&tree, &args.folder))
        .map_err(|source| MtbError::io(&path, source))?;
    match output_mode(cli) {
        OutputMode::Human => {
            println!("Wrote {}", path.display());
            Ok(())
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "index",
            "path": path,
        })),
    }
}

fn run_retest(cli: &Cli, args: &RetestArgs) -> Result<(), CliError> {
    let _config = load_config(cli)?;
    let mode = output_mode(cli);
    for folder in &args.folders {
        let had_marker = retest(folder)?;
        match mode {
            OutputMode::Human => {
                if had_marker {
                    println!("{} will be repeated", folder.display());
                } else {
                    println!("{} had no collected data", folder.display());
                }
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "retest",
                "folder": folder,
                "had_data": had_marker,
            }))?,
        }
    }
    Ok(())
}

// ──────────────────── output helpers ────────────────────

fn format_secs(total: u64) -> String {
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("mtb {version}");
            if args.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "mtb",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("MTB_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from([
            "mtb",
            "--config",
            "/tmp/mtb.toml",
            "--json",
            "--no-color",
            "-v",
            "estimate",
            "plan.toml",
        ]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["mtb", "estimate", "plan.toml", "--json", "-q"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_subcommands() {
        let cases = [
            vec!["mtb", "run", "plan.toml", "--yes", "--retest"],
            vec!["mtb", "run", "plan.toml", "--interactive", "--reanalyze"],
            vec!["mtb", "tree", "results", "--order", "1,0"],
            vec!["mtb", "index", "results"],
            vec!["mtb", "retest", "a/test", "b/test"],
            vec!["mtb", "version", "--verbose"],
            vec!["mtb", "completions", "bash"],
        ];
        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn order_is_comma_separated() {
        let cli = Cli::try_parse_from(["mtb", "tree", "r", "--order", "2,0,1"]).unwrap();
        let Command::Tree(args) = cli.command else {
            panic!("expected tree");
        };
        assert_eq!(args.order, [2, 0, 1]);
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["mtb", "-v", "-q", "version"]).is_err());
        assert!(Cli::try_parse_from(["mtb", "retest"]).is_err());
    }

    #[test]
    fn output_mode_resolution() {
        assert_eq!(resolve_output_mode(true, Some("human"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("JSON"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("human"), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("auto"), true), OutputMode::Human);
    }

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(CliError::from(MtbError::Cancelled).exit_code(), 130);
        assert_eq!(
            CliError::from(MtbError::configuration("duplicate tag")).exit_code(),
            1
        );
        let env = MtbError::Environment {
            action: "reset",
            details: "exit status 1".to_string(),
        };
        assert_eq!(CliError::from(env).exit_code(), 2);
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_secs(5), "5s");
        assert_eq!(format_secs(65), "1m 05s");
        assert_eq!(format_secs(3_725), "1h 02m 05s");
    }
}
