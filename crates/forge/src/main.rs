//! forge - command line entry point.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::WrapErr;
use forge::asker::{Asker, StdinAsker};
use forge::engine::RunOutcome;
use forge::Forge;
use forge_core::Config;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Exit status when the iteration budget ran out before completion.
const EXIT_EXHAUSTED: u8 = 2;

/// Oracle-driven code iteration for a project directory.
#[derive(Parser)]
#[command(name = "forge", version)]
#[command(about = "Iterate on a project with an oracle until a task is done")]
struct Cli {
    /// Project root (asked for when omitted)
    #[arg(long, env = "FORGE_PROJECT")]
    project: Option<PathBuf>,

    /// Task description (asked for when omitted)
    #[arg(long)]
    task: Option<String>,

    /// Config file path (overrides .forge/config)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum generate/execute/analyze cycles
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Maximum number of files selected for the task
    #[arg(long)]
    max_files: Option<usize>,

    /// Maximum total bytes of selected files
    #[arg(long)]
    max_total_size: Option<usize>,

    /// Do not ask the oracle's questions interactively
    #[arg(long)]
    no_questions: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to create tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> eyre::Result<ExitCode> {
    let asker: Arc<dyn Asker> = Arc::new(StdinAsker::new());

    let project = match &cli.project {
        Some(project) => project.clone(),
        None => {
            let answer = asker
                .ask("Project directory (empty for current directory):")
                .await
                .wrap_err("failed to read project directory")?;
            if answer.is_empty() {
                std::env::current_dir().wrap_err("failed to resolve current directory")?
            } else {
                PathBuf::from(answer)
            }
        }
    };
    let project = project
        .canonicalize()
        .wrap_err_with(|| format!("project directory not found: {}", project.display()))?;

    // The first load only picks the log filter; the second runs with logging
    // installed so config warnings are visible.
    init_tracing(&load_config(&cli, &project)?.log_filter);
    let config = load_config(&cli, &project)?;

    let description = match &cli.task {
        Some(task) => task.clone(),
        None => asker
            .ask("Describe the task:")
            .await
            .wrap_err("failed to read task description")?,
    };
    eyre::ensure!(!description.trim().is_empty(), "task description is empty");

    info!(project = %project.display(), max_iterations = config.max_iterations, "starting forge");
    let forge = Forge::with_command_oracle(config, &project, asker)
        .wrap_err("failed to set up project search")?;
    let report = forge.run(&description).await.wrap_err("run aborted")?;

    for summary in &report.summaries {
        println!("{summary}");
    }
    match &report.outcome {
        RunOutcome::Completed { reason } => {
            println!("Task completed after {} iteration(s): {reason}", report.iterations);
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Exhausted { max_iterations } => {
            println!("Task not completed within {max_iterations} iteration(s)");
            Ok(ExitCode::from(EXIT_EXHAUSTED))
        }
    }
}

/// Defaults, then `<project>/.forge/config`, then `--config`, then flags.
fn load_config(cli: &Cli, project: &Path) -> eyre::Result<Config> {
    let mut config = Config::for_project(project).wrap_err("failed to load project config")?;
    if let Some(path) = &cli.config {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
    }

    if let Some(max_iterations) = cli.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(max_files) = cli.max_files {
        config.max_files = max_files;
    }
    if let Some(max_total_size) = cli.max_total_size {
        config.max_total_size = max_total_size;
    }
    if cli.no_questions {
        config.enable_questions = false;
    }

    config.resolve_paths(project);
    Ok(config)
}

fn init_tracing(default_filter: &str) {
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_filter))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("forge").chain(args.iter().copied()))
    }

    #[test]
    fn flags_override_config_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".forge")).unwrap();
        std::fs::write(
            dir.path().join(".forge/config"),
            "max_iterations=4\nmax_files=9\npackage_manager=npm\n",
        )
        .unwrap();
        let extra = dir.path().join("extra.conf");
        std::fs::write(&extra, "max_files=12\nenable_questions=true\n").unwrap();

        let args = cli(&[
            "--config",
            extra.to_str().unwrap(),
            "--max-iterations",
            "7",
            "--no-questions",
        ]);
        let config = load_config(&args, dir.path()).unwrap();
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.max_files, 12);
        assert_eq!(config.package_manager, "npm");
        assert!(!config.enable_questions);
        assert_eq!(config.history_file, dir.path().join(".forge/task_history.tsv"));
    }

    #[test]
    fn invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".forge")).unwrap();
        std::fs::write(dir.path().join(".forge/config"), "max_files=lots\n").unwrap();
        assert!(load_config(&cli(&[]), dir.path()).is_err());
    }
}
