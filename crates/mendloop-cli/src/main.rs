//! mendloop CLI
//!
//! ## Commands
//!
//! - `run`: drive the recovery loop against a working tree
//! - `validate`: check a patch file against the safety policy
//! - `repair`: rewrite a patch's offsets and counts against the tree
//! - `apply`: apply (or reverse) a patch with rollback on failure
//! - `replay`: summarise a recorded run and verify its artifacts

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};

use mendloop_core::workspace::is_git_repo;
use mendloop_core::{
    apply_patch, new_run_id, parse_patch, replay_run, validate, ApproveAll, Collaborators,
    CommandProposer, CommandReviewer, CommandTestRunner, DirSource, InterruptSignal, Orchestrator,
    RecoveryConfig, Repairer, Reviewer, RunOutcome, RunRecorder, GitWorkspace, SnapshotWorkspace,
    Workspace,
};

/// Default config file, looked up in the working tree root.
const CONFIG_FILE: &str = "mendloop.toml";

const EXIT_FAILED: u8 = 1;
const EXIT_TIMED_OUT: u8 = 2;
const EXIT_MAX_ITERATIONS: u8 = 3;
const EXIT_SETUP: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "mendloop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bounded, auditable recovery from failing tests", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: <root>/mendloop.toml if present)
    #[arg(short, long, global = true, env = "MENDLOOP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RootArg {
    /// Working tree root
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recovery loop until tests pass or a budget runs out
    Run {
        #[command(flatten)]
        root: RootArg,

        /// Command that runs the test suite
        #[arg(long, env = "MENDLOOP_TEST_CMD")]
        test_cmd: String,

        /// Command that reads a JSON request on stdin and prints a patch
        #[arg(long, env = "MENDLOOP_PROPOSE_CMD")]
        propose_cmd: String,

        /// Command that approves or rejects a patch (default: approve all)
        #[arg(long, env = "MENDLOOP_REVIEW_CMD")]
        review_cmd: Option<String>,

        #[arg(long)]
        max_iterations: Option<u32>,

        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Cap on any single collaborator call
        #[arg(long)]
        call_timeout_secs: Option<u64>,

        /// Where run directories are written
        #[arg(long)]
        runs_dir: Option<PathBuf>,
    },

    /// Check a patch against the safety policy
    Validate {
        #[command(flatten)]
        root: RootArg,

        /// Patch file, or `-` for stdin
        patch: PathBuf,
    },

    /// Repair a patch against the working tree and print the result
    Repair {
        #[command(flatten)]
        root: RootArg,

        /// Patch file, or `-` for stdin
        patch: PathBuf,

        /// Write the repaired patch here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Apply a patch to the working tree
    Apply {
        #[command(flatten)]
        root: RootArg,

        /// Patch file, or `-` for stdin
        patch: PathBuf,

        /// Apply the inverse patch
        #[arg(short = 'R', long)]
        reverse: bool,

        /// Repair offsets and counts before applying
        #[arg(long)]
        repair: bool,
    },

    /// Summarise a recorded run
    Replay {
        #[command(flatten)]
        root: RootArg,

        /// Run ID
        run: String,

        /// Directory containing run directories (default: runs_dir from config, under the root)
        #[arg(long)]
        runs_dir: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json_output: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    mendloop_core::init_tracing(cli.json, level);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_SETUP)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            root,
            test_cmd,
            propose_cmd,
            review_cmd,
            max_iterations,
            timeout_secs,
            call_timeout_secs,
            runs_dir,
        } => {
            let mut config = load_config(config_path, &root.root)?;
            if let Some(n) = max_iterations {
                config.max_iterations = n;
            }
            if let Some(s) = timeout_secs {
                config.timeout_secs = s;
            }
            if call_timeout_secs.is_some() {
                config.call_timeout_secs = call_timeout_secs;
            }
            if let Some(dir) = runs_dir {
                config.runs_dir = dir;
            }
            cmd_run(config, &root.root, test_cmd, propose_cmd, review_cmd).await
        }
        Commands::Validate { root, patch } => {
            let config = load_config(config_path, &root.root)?;
            cmd_validate(&config, &patch)
        }
        Commands::Repair {
            root,
            patch,
            output,
        } => {
            let config = load_config(config_path, &root.root)?;
            cmd_repair(&config, &root.root, &patch, output.as_deref())
        }
        Commands::Apply {
            root,
            patch,
            reverse,
            repair,
        } => {
            let config = load_config(config_path, &root.root)?;
            cmd_apply(&config, &root.root, &patch, reverse, repair)
        }
        Commands::Replay {
            root,
            run,
            runs_dir,
            json_output,
        } => {
            let config = load_config(config_path, &root.root)?;
            let runs_dir = runs_dir.unwrap_or_else(|| runs_dir_under(&root.root, &config));
            cmd_replay(&runs_dir, &run, json_output)
        }
    }
}

/// Read `explicit`, else `<root>/mendloop.toml` if it exists, else defaults.
fn load_config(explicit: Option<&Path>, root: &Path) -> Result<RecoveryConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let default = root.join(CONFIG_FILE);
            if !default.exists() {
                return Ok(RecoveryConfig::default());
            }
            default
        }
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let config: RecoveryConfig = toml::from_str(&text)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// The configured runs directory, relative paths taken from `root`.
fn runs_dir_under(root: &Path, config: &RecoveryConfig) -> PathBuf {
    if config.runs_dir.is_absolute() {
        config.runs_dir.clone()
    } else {
        root.join(&config.runs_dir)
    }
}

fn read_patch(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read patch from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read patch: {}", path.display()))
}

fn exit_code(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Success => 0,
        RunOutcome::Failed { .. } => EXIT_FAILED,
        RunOutcome::TimedOut => EXIT_TIMED_OUT,
        RunOutcome::MaxIterationsExceeded => EXIT_MAX_ITERATIONS,
        RunOutcome::Interrupted => EXIT_INTERRUPTED,
    }
}

async fn cmd_run(
    config: RecoveryConfig,
    root: &Path,
    test_cmd: String,
    propose_cmd: String,
    review_cmd: Option<String>,
) -> Result<ExitCode> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve root: {}", root.display()))?;
    let runs_dir = runs_dir_under(&root, &config);
    let exclude: Vec<String> = runs_dir
        .strip_prefix(&root)
        .ok()
        .map(|rel| vec![rel.to_string_lossy().into_owned()])
        .unwrap_or_default();

    let run_id = new_run_id(chrono::Utc::now());
    let workspace: Box<dyn Workspace> = if is_git_repo(&root) {
        Box::new(GitWorkspace::open(&root, &run_id, exclude)?)
    } else {
        warn!(root = %root.display(), "not a git work tree; using in-memory snapshots");
        Box::new(SnapshotWorkspace::open(&root, exclude)?)
    };
    let recorder = RunRecorder::create(&runs_dir, &run_id)?;

    let reviewer: Arc<dyn Reviewer> = match review_cmd {
        Some(cmd) => Arc::new(CommandReviewer::new(cmd, root.clone())),
        None => Arc::new(ApproveAll),
    };
    let collab = Collaborators::new(
        Arc::new(CommandProposer::new(propose_cmd, root.clone())),
        reviewer,
        Arc::new(CommandTestRunner::new(test_cmd, root.clone())),
    );

    let orchestrator = Orchestrator::new(config, collab, workspace, recorder)?;

    let interrupt = InterruptSignal::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current step");
            trigger.trigger();
        }
    });

    info!(run_id = %run_id, root = %root.display(), "starting recovery run");
    let report = orchestrator.run(interrupt).await;

    let m = &report.metrics;
    println!("Run:        {}", report.run.id);
    println!("Outcome:    {}", report.outcome);
    println!(
        "Tests:      {} failing initially, {} fixed, {} remaining",
        m.tests_failing_initially, m.tests_fixed, m.tests_remaining
    );
    println!(
        "Iterations: {} used, {} improved, {} rejected, {} rolled back",
        m.iterations_used, m.iterations_improved, m.attempts_rejected, m.attempts_rolled_back
    );
    println!("Artifacts:  {}", report.run_dir.display());

    Ok(ExitCode::from(exit_code(&report.outcome)))
}

fn cmd_validate(config: &RecoveryConfig, patch_path: &Path) -> Result<ExitCode> {
    let policy = config.safety_policy()?;
    let patch = parse_patch(&read_patch(patch_path)?)?;
    let report = validate(&patch, &policy);

    println!(
        "{} file(s), {} changed line(s)",
        report.analysis.files.len(),
        report.analysis.changed_lines
    );
    if report.ok {
        println!("OK");
        return Ok(ExitCode::SUCCESS);
    }
    for violation in &report.violations {
        println!("REJECTED: {}", violation.detail);
    }
    Ok(ExitCode::from(EXIT_FAILED))
}

fn cmd_repair(
    config: &RecoveryConfig,
    root: &Path,
    patch_path: &Path,
    output: Option<&Path>,
) -> Result<ExitCode> {
    let patch = parse_patch(&read_patch(patch_path)?)?;
    let outcome = Repairer::new(config.repair.clone()).repair(&patch, &DirSource::new(root));

    for action in &outcome.actions {
        eprintln!("repaired: {}", serde_json::to_string(action)?);
    }
    for dropped in &outcome.dropped {
        eprintln!(
            "dropped: {} hunk {}: {}",
            dropped.path, dropped.hunk, dropped.reason
        );
    }

    let text = outcome.patch.to_string();
    match output {
        Some(path) => std::fs::write(path, &text)
            .with_context(|| format!("Failed to write repaired patch: {}", path.display()))?,
        None => print!("{text}"),
    }
    Ok(if outcome.is_partial() {
        ExitCode::from(EXIT_FAILED)
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_apply(
    config: &RecoveryConfig,
    root: &Path,
    patch_path: &Path,
    reverse: bool,
    repair: bool,
) -> Result<ExitCode> {
    let mut patch = parse_patch(&read_patch(patch_path)?)?;
    if reverse {
        patch = patch.reversed();
    }
    if repair {
        let outcome = Repairer::new(config.repair.clone()).repair(&patch, &DirSource::new(root));
        if outcome.is_partial() {
            eprintln!("{} hunk(s) could not be placed", outcome.dropped.len());
            return Ok(ExitCode::from(EXIT_FAILED));
        }
        patch = outcome.patch;
    }

    match apply_patch(&patch, root) {
        Ok(report) => {
            println!(
                "Applied {} hunk(s) to {} file(s)",
                report.hunks_applied,
                report.files_changed()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("apply failed, tree restored: {e}");
            Ok(ExitCode::from(EXIT_FAILED))
        }
    }
}

fn cmd_replay(runs_dir: &Path, run_id: &str, json_output: bool) -> Result<ExitCode> {
    let run_dir = runs_dir.join(run_id);
    if !run_dir.is_dir() {
        anyhow::bail!("Run directory not found: {}", run_dir.display());
    }
    let summary = replay_run(&run_dir).with_context(|| format!("Failed to replay run {run_id}"))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{summary}");
        println!("artifacts {} verified", summary.artifacts.len());
    }
    Ok(match &summary.outcome {
        Some(outcome) => ExitCode::from(exit_code(outcome)),
        None => ExitCode::from(EXIT_FAILED),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "mendloop",
            "run",
            "--test-cmd",
            "cargo test",
            "--propose-cmd",
            "./propose.sh",
            "--max-iterations",
            "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                max_iterations,
                review_cmd,
                ..
            } => {
                assert_eq!(max_iterations, Some(3));
                assert!(review_cmd.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_validate_and_replay_take_root() {
        let cli = Cli::try_parse_from(["mendloop", "validate", "--root", "/srv/tree", "p.diff"])
            .unwrap();
        match cli.command {
            Commands::Validate { root, patch } => {
                assert_eq!(root.root, PathBuf::from("/srv/tree"));
                assert_eq!(patch, PathBuf::from("p.diff"));
            }
            _ => panic!("expected validate"),
        }

        let cli = Cli::try_parse_from(["mendloop", "replay", "--root", "/srv/tree", "run-1"]).unwrap();
        match cli.command {
            Commands::Replay { root, runs_dir, .. } => {
                assert!(runs_dir.is_none());
                let config = RecoveryConfig::default();
                assert_eq!(
                    runs_dir_under(&root.root, &config),
                    PathBuf::from("/srv/tree/.mendloop/runs")
                );
            }
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn test_validate_reads_policy_from_root_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[safety]\nmax_changed_lines = 1\n").unwrap();
        let patch = dir.path().join("p.diff");
        std::fs::write(&patch, "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-a\n+b\n").unwrap();

        let config = load_config(None, dir.path()).unwrap();
        assert_eq!(config.safety.max_changed_lines, 1);
        let parsed = parse_patch(&read_patch(&patch).unwrap()).unwrap();
        let report = validate(&parsed, &config.safety_policy().unwrap());
        assert!(!report.ok);
    }

    #[test]
    fn test_missing_config_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(None, dir.path()).unwrap();
        assert_eq!(config, RecoveryConfig::default());
    }

    #[test]
    fn test_toml_config_loaded_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "max_iterations = 2\n\n[safety]\nmax_files = 3\n",
        )
        .unwrap();
        let config = load_config(None, dir.path()).unwrap();
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.safety.max_files, 3);
    }

    #[test]
    fn test_invalid_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_iterations = 0\n").unwrap();
        assert!(load_config(Some(&path), dir.path()).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&RunOutcome::Success), 0);
        assert_eq!(exit_code(&RunOutcome::TimedOut), 2);
        assert_eq!(exit_code(&RunOutcome::MaxIterationsExceeded), 3);
        assert_eq!(exit_code(&RunOutcome::Interrupted), 130);
    }

    #[test]
    fn test_apply_then_reverse_via_commands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let patch = dir.path().join("p.diff");
        std::fs::write(
            &patch,
            "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n one\n-two\n+TWO\n",
        )
        .unwrap();
        let config = RecoveryConfig::default();

        cmd_apply(&config, dir.path(), &patch, false, false).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\nTWO\n");
        cmd_apply(&config, dir.path(), &patch, true, false).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\ntwo\n");
    }
}
