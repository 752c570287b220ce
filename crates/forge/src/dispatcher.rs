//! Tool dispatcher.
//!
//! Executes the tool usages requested by the oracle against the project tree:
//! file moves, deletes and updates, file requests, and package manager
//! commands. Every failure is reported as a failed `ToolResult`; nothing here
//! aborts the run.

use crate::paths::{self, PathError};
use crate::process::{describe_timeout, CommandOutcome, CommandRunner};
use crate::search::expand_braces;
use forge_core::history::generate_diff;
use forge_core::{
    current_version, Config, File, FileHistory, FileUpdate, PackageCommand, ToolOperation,
    ToolResult, ToolResults, ToolUsage, ToolUsageError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Result key of the automatic dependency install.
pub const INSTALL_KEY: &str = "install";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Usage(#[from] ToolUsageError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("failed to run command: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    fn io<'a>(op: &'static str, path: &'a str) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| Self::Io {
            op,
            path: path.to_string(),
            source,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub package_manager: String,
    /// Installed dependencies, relative to the project root.
    pub dependency_dir: String,
    /// Toolchain commands run after every batch.
    pub standard_cmds: Vec<String>,
    pub command_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            package_manager: config.package_manager.clone(),
            dependency_dir: config.dependency_dir.clone(),
            standard_cmds: config.standard_cmds.clone(),
            command_timeout: config.command_timeout(),
        }
    }
}

/// Everything one batch of tool usages produced.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub results: ToolResults,
    /// Files read by `requestFiles`.
    pub new_files: Vec<File>,
    /// Files written or moved into place, in first-touch order.
    pub modified_files: Vec<String>,
    /// One entry per successful `updateFile`.
    pub updates: Vec<FileUpdate>,
}

impl DispatchOutcome {
    /// Number of failed results.
    pub fn failed_count(&self) -> usize {
        self.results.values().filter(|r| !r.success).count()
    }

    fn touch(&mut self, file_name: String) {
        if !self.modified_files.contains(&file_name) {
            self.modified_files.push(file_name);
        }
    }
}

/// Executes tool usages inside one project root.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    root: PathBuf,
    config: DispatcherConfig,
    runner: CommandRunner,
}

impl ToolDispatcher {
    pub fn new(root: impl Into<PathBuf>, config: DispatcherConfig) -> Self {
        let runner = CommandRunner::new(config.command_timeout);
        Self {
            root: root.into(),
            config,
            runner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Execute `usages` in order, then install dependencies if they are missing.
    ///
    /// `history` supplies the starting version of each file; versions advance
    /// within the batch so two updates of one file get consecutive versions.
    pub async fn run(&self, usages: &[ToolUsage], history: &[FileHistory]) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let mut versions: HashMap<String, u32> = HashMap::new();

        for usage in usages {
            let key = usage.result_key();
            let op = match ToolOperation::from_usage(usage) {
                Ok(op) => op,
                Err(ToolUsageError::Unknown(name)) => {
                    warn!(tool = %name, "skipping unrecognized tool");
                    continue;
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "invalid tool usage");
                    outcome.results.insert(key, ToolResult::failure(err.to_string()));
                    continue;
                }
            };

            debug!(key = %key, "executing tool");
            let result = match self
                .execute(op, usage, history, &mut versions, &mut outcome)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    warn!(key = %key, error = %err, "tool failed");
                    ToolResult::failure(err.to_string())
                }
            };
            if !result.success {
                debug!(key = %key, timed_out = result.timed_out, "tool reported failure");
            }
            outcome.results.insert(key, result);
        }

        if !self.root.join(&self.config.dependency_dir).exists() {
            info!(dir = %self.config.dependency_dir, "dependency directory missing; installing");
            let command = PackageCommand::Install
                .command_line(&self.config.package_manager, &self.config.dependency_dir);
            let result = self.run_command(&command).await;
            outcome.results.insert(INSTALL_KEY.to_string(), result);
        }

        info!(
            results = outcome.results.len(),
            failed = outcome.failed_count(),
            updates = outcome.updates.len(),
            "tool batch finished"
        );
        outcome
    }

    /// Run the fixed toolchain commands. Results are keyed by command line.
    pub async fn run_standard_tools(&self) -> ToolResults {
        let mut results = ToolResults::new();
        for command in &self.config.standard_cmds {
            let result = self.run_command(command).await;
            info!(cmd = %command, success = result.success, "standard tool finished");
            results.insert(command.clone(), result);
        }
        results
    }

    async fn execute(
        &self,
        op: ToolOperation,
        usage: &ToolUsage,
        history: &[FileHistory],
        versions: &mut HashMap<String, u32>,
        outcome: &mut DispatchOutcome,
    ) -> Result<ToolResult> {
        match op {
            ToolOperation::MoveFile {
                source,
                destination,
            } => {
                let from = paths::resolve(&self.root, &source)?;
                let to_relative = paths::normalize(&self.root, &destination)?;
                let to = self.root.join(&to_relative);
                std::fs::symlink_metadata(&from).map_err(DispatchError::io("move", &source))?;
                create_parent(&to, &destination)?;
                std::fs::rename(&from, &to).map_err(DispatchError::io("move", &source))?;
                outcome.touch(paths::display_name(&to_relative));
                Ok(ToolResult::success(format!("Moved {source} to {destination}")))
            }
            ToolOperation::DeleteFile { file_name } => {
                let path = paths::resolve(&self.root, &file_name)?;
                std::fs::remove_file(&path).map_err(DispatchError::io("delete", &file_name))?;
                Ok(ToolResult::success(format!("Deleted {file_name}")))
            }
            ToolOperation::UpdateFile { file_name, content } => {
                let relative = paths::normalize(&self.root, &file_name)?;
                let name = paths::display_name(&relative);
                let path = self.root.join(&relative);

                let previous = match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
                    Err(err) => return Err(DispatchError::io("read", &file_name)(err)),
                };
                create_parent(&path, &file_name)?;
                std::fs::write(&path, &content).map_err(DispatchError::io("write", &file_name))?;

                let version = versions
                    .entry(name.clone())
                    .or_insert_with(|| current_version(history, &name));
                let from_version = *version;
                *version += 1;
                outcome.updates.push(FileUpdate {
                    file_name: name.clone(),
                    from_version,
                    new_version: *version,
                    diff: generate_diff(&previous, &content),
                    comment: format!("Update from tool execution: {}", usage.reasoning),
                });
                outcome.touch(name.clone());
                Ok(ToolResult::success(format!(
                    "Updated {name} to version {}",
                    *version
                )))
            }
            ToolOperation::RequestFiles { file_pattern } => {
                let files = self.request_files(&file_pattern)?;
                if files.is_empty() {
                    return Ok(ToolResult::failure(format!(
                        "No files match pattern {file_pattern}"
                    )));
                }
                let names = files
                    .iter()
                    .map(|f| f.file_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let message = format!("Read {} file(s): {names}", files.len());
                outcome.new_files.extend(files);
                Ok(ToolResult::success(message))
            }
            ToolOperation::Package(command) => {
                let line =
                    command.command_line(&self.config.package_manager, &self.config.dependency_dir);
                Ok(self.run_command(&line).await)
            }
        }
    }

    fn request_files(&self, pattern: &str) -> Result<Vec<File>> {
        let relative = paths::normalize(&self.root, pattern)?;
        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        let mut files = Vec::new();
        for expanded in expand_braces(&paths::display_name(&relative)) {
            let full = format!("{root}/{expanded}");
            for path in glob::glob(&full)?.filter_map(std::result::Result::ok) {
                if !path.is_file() {
                    continue;
                }
                let Some(name) = paths::relative_name(&self.root, &path) else {
                    continue;
                };
                if paths::is_reserved(Path::new(&name)) {
                    continue;
                }
                if files.iter().any(|f: &File| f.file_name == name) {
                    continue;
                }
                let content =
                    std::fs::read_to_string(&path).map_err(DispatchError::io("read", &name))?;
                files.push(File::new(name, content));
            }
        }
        Ok(files)
    }

    async fn run_command(&self, command: &str) -> ToolResult {
        match self.runner.run(command, &self.root).await {
            Ok(outcome) => command_result(outcome),
            Err(err) => {
                warn!(cmd = %command, error = %err, "failed to spawn command");
                ToolResult::failure(DispatchError::Spawn(err).to_string())
            }
        }
    }
}

fn create_parent(path: &Path, name: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(DispatchError::io("create directory for", name))?;
    }
    Ok(())
}

fn command_result(outcome: CommandOutcome) -> ToolResult {
    match outcome {
        CommandOutcome::TimedOut { timeout, .. } => ToolResult::timeout(format!(
            "Command timed out after {}",
            describe_timeout(timeout)
        )),
        CommandOutcome::Completed {
            exit_code,
            stdout,
            stderr,
            ..
        } => {
            let output = [stdout.trim(), stderr.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            if exit_code == 0 {
                ToolResult::success(output)
            } else {
                ToolResult::failure(format!("Command failed with exit code {exit_code}\n{output}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::history;
    use tempfile::TempDir;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            package_manager: "echo pm".into(),
            dependency_dir: "node_modules".into(),
            standard_cmds: vec!["true".into(), "false".into()],
            command_timeout: Duration::from_secs(5),
        }
    }

    /// A project whose dependency directory exists, so no install runs.
    fn project() -> (TempDir, ToolDispatcher) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        let dispatcher = ToolDispatcher::new(dir.path(), config());
        (dir, dispatcher)
    }

    fn update(name: &str, content: &str) -> ToolUsage {
        ToolUsage::new("updateFile")
            .with_param("fileName", name)
            .with_param("content", content)
            .with_reasoning("needed")
    }

    #[tokio::test]
    async fn update_missing_file_creates_version_one() {
        let (dir, dispatcher) = project();
        let outcome = dispatcher.run(&[update("foo.ts", "x")], &[]).await;

        assert_eq!(std::fs::read_to_string(dir.path().join("foo.ts")).unwrap(), "x");
        assert_eq!(outcome.modified_files, vec!["foo.ts"]);
        assert_eq!(
            outcome.updates,
            vec![FileUpdate {
                file_name: "foo.ts".into(),
                from_version: 0,
                new_version: 1,
                diff: "+x".into(),
                comment: "Update from tool execution: needed".into(),
            }]
        );

        let merged = history::merge(Vec::new(), &outcome.updates).unwrap();
        assert_eq!(merged[0].current_version, 1);
        assert_eq!(merged[0].version_diffs.len(), 1);
    }

    #[tokio::test]
    async fn versions_advance_within_a_batch() {
        let (_dir, dispatcher) = project();
        let existing = history::merge(
            Vec::new(),
            &[FileUpdate {
                file_name: "src/a.ts".into(),
                from_version: 0,
                new_version: 1,
                diff: "+a".into(),
                comment: String::new(),
            }],
        )
        .unwrap();

        let outcome = dispatcher
            .run(
                &[update("src/a.ts", "one\n"), update("./src/a.ts", "two\n")],
                &existing,
            )
            .await;
        let versions: Vec<_> = outcome
            .updates
            .iter()
            .map(|u| (u.from_version, u.new_version))
            .collect();
        assert_eq!(versions, vec![(1, 2), (2, 3)]);
        assert_eq!(outcome.updates[1].diff, "-one\n+two");

        let merged = history::merge(existing, &outcome.updates).unwrap();
        assert!(merged[0].is_consistent());
        assert_eq!(merged[0].current_version, 3);
    }

    #[tokio::test]
    async fn move_and_delete() {
        let (dir, dispatcher) = project();
        std::fs::write(dir.path().join("old.ts"), "o").unwrap();
        std::fs::write(dir.path().join("gone.ts"), "g").unwrap();

        let usages = [
            ToolUsage::new("moveFile")
                .with_param("source", "old.ts")
                .with_param("destination", "lib/new.ts"),
            ToolUsage::new("deleteFile").with_param("fileName", "gone.ts"),
            ToolUsage::new("deleteFile").with_param("fileName", "never.ts"),
        ];
        let outcome = dispatcher.run(&usages, &[]).await;

        assert!(dir.path().join("lib/new.ts").exists());
        assert!(!dir.path().join("gone.ts").exists());
        assert_eq!(outcome.modified_files, vec!["lib/new.ts"]);
        assert!(outcome.results["deleteFile|fileName=gone.ts"].success);
        assert!(!outcome.results["deleteFile|fileName=never.ts"].success);
        assert_eq!(outcome.failed_count(), 1);
    }

    #[tokio::test]
    async fn move_of_missing_source_leaves_tree_untouched() {
        let (dir, dispatcher) = project();

        let usage = ToolUsage::new("moveFile")
            .with_param("source", "absent.ts")
            .with_param("destination", "deep/nested/absent.ts");
        let outcome = dispatcher.run(&[usage], &[]).await;

        assert_eq!(outcome.failed_count(), 1);
        assert!(outcome.modified_files.is_empty());
        assert!(!dir.path().join("deep").exists());
    }

    #[tokio::test]
    async fn state_directory_is_out_of_reach() {
        let (dir, dispatcher) = project();
        std::fs::create_dir_all(dir.path().join(".forge")).unwrap();
        std::fs::write(dir.path().join(".forge/task_history.tsv"), "log").unwrap();
        std::fs::write(dir.path().join("a.ts"), "A").unwrap();

        let usages = [
            ToolUsage::new("deleteFile").with_param("fileName", ".forge/task_history.tsv"),
            ToolUsage::new("updateFile")
                .with_param("fileName", "./.forge/config")
                .with_param("content", "max_files=1"),
            ToolUsage::new("requestFiles").with_param("filePattern", "**/*"),
        ];
        let outcome = dispatcher.run(&usages, &[]).await;

        assert!(!outcome.results["deleteFile|fileName=.forge/task_history.tsv"].success);
        assert!(!outcome.results["updateFile|content=max_files=1,fileName=./.forge/config"].success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".forge/task_history.tsv")).unwrap(),
            "log"
        );
        assert!(!dir.path().join(".forge/config").exists());
        let requested: Vec<_> = outcome.new_files.iter().map(|f| f.file_name.as_str()).collect();
        assert!(requested.contains(&"a.ts"));
        assert!(!requested.iter().any(|name| name.starts_with(".forge")));
    }

    #[tokio::test]
    async fn request_files_reads_matches() {
        let (dir, dispatcher) = project();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.ts"), "A").unwrap();
        std::fs::write(dir.path().join("src/b.tsx"), "B").unwrap();
        std::fs::write(dir.path().join("src/c.css"), "C").unwrap();

        let usages = [
            ToolUsage::new("requestFiles").with_param("filePattern", "src/*.{ts,tsx}"),
            ToolUsage::new("requestFiles").with_param("filePattern", "lib/*.ts"),
        ];
        let outcome = dispatcher.run(&usages, &[]).await;

        assert_eq!(
            outcome.new_files,
            vec![File::new("src/a.ts", "A"), File::new("src/b.tsx", "B")]
        );
        assert!(outcome.results["requestFiles|filePattern=src/*.{ts,tsx}"].success);
        assert!(!outcome.results["requestFiles|filePattern=lib/*.ts"].success);
    }

    #[tokio::test]
    async fn unknown_tools_are_skipped_and_invalid_usages_fail() {
        let (_dir, dispatcher) = project();
        let usages = [
            ToolUsage::new("launchRocket"),
            ToolUsage::new(""),
            ToolUsage::new("yarnAdd"),
        ];
        let outcome = dispatcher.run(&usages, &[]).await;

        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.results.contains_key("launchRocket|"));
        assert!(!outcome.results["|"].success);
        assert!(outcome.results["yarnAdd|"].message.contains("package"));
    }

    #[tokio::test]
    async fn paths_outside_root_are_rejected() {
        let (dir, dispatcher) = project();
        let outcome = dispatcher.run(&[update("../escape.ts", "x")], &[]).await;

        let result = &outcome.results["updateFile|content=x,fileName=../escape.ts"];
        assert!(!result.success);
        assert!(result.message.contains("escapes"));
        assert!(!dir.path().parent().unwrap().join("escape.ts").exists());
        assert!(outcome.updates.is_empty());
    }

    #[tokio::test]
    async fn package_commands_use_configured_manager() {
        let (_dir, dispatcher) = project();
        let usages = [
            ToolUsage::new("yarnAdd").with_param("package", "lodash"),
            ToolUsage::new("yarn").with_param("command", "lint"),
        ];
        let outcome = dispatcher.run(&usages, &[]).await;
        assert_eq!(outcome.results["yarnAdd|package=lodash"].message, "pm add lodash");
        assert_eq!(outcome.results["yarn|command=lint"].message, "pm lint");
    }

    #[tokio::test]
    async fn missing_dependencies_install_once() {
        let dir = TempDir::new().unwrap();
        let dispatcher = ToolDispatcher::new(dir.path(), config());
        let usages = [update("a.ts", "a"), update("b.ts", "b")];
        let outcome = dispatcher.run(&usages, &[]).await;

        assert_eq!(outcome.results[INSTALL_KEY].message, "pm install");
        assert_eq!(outcome.results.len(), 3);
    }

    #[tokio::test]
    async fn timeout_is_distinct_from_exit_code() {
        let (_dir, mut dispatcher) = project();
        dispatcher.runner = CommandRunner::new(Duration::from_millis(200));
        dispatcher.config.package_manager = "sleep".into();

        let outcome = dispatcher
            .run(
                &[
                    ToolUsage::new("yarn").with_param("command", "10"),
                    ToolUsage::new("yarn").with_param("command", "soon"),
                ],
                &[],
            )
            .await;

        let slow = &outcome.results["yarn|command=10"];
        assert!(!slow.success);
        assert!(slow.timed_out);
        assert_eq!(slow.message, "Command timed out after 200 ms");

        let failed = &outcome.results["yarn|command=soon"];
        assert!(!failed.success);
        assert!(!failed.timed_out);
        assert!(failed.message.starts_with("Command failed with exit code 1"));
    }

    #[tokio::test]
    async fn standard_tools_always_run() {
        let (_dir, dispatcher) = project();
        let results = dispatcher.run_standard_tools().await;
        assert!(results["true"].success);
        assert!(!results["false"].success);
    }
}
