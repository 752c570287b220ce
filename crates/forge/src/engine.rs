//! Iteration engine.
//!
//! Drives one task from file selection through repeated generate, execute and
//! analyze cycles until the oracle declares the task complete or the iteration
//! budget runs out.
//!
//! ```text
//! Selecting -> Generating -> Executing -> Analyzing -> Generating | Complete | Exhausted
//! ```

use crate::asker::Asker;
use crate::dispatcher::ToolDispatcher;
use crate::oracle::OracleClient;
use crate::paths;
use crate::selector::{FileSelector, SelectorLimits};
use forge_core::history::{self, HistoryError};
use forge_core::prompt::{analysis_prompt, generation_prompt};
use forge_core::{
    Clarification, Config, File, Id, IterationLog, IterationRow, OracleResponse, RowKind, Task,
    ToolResults, DEFAULT_ACTIONS_SUMMARY,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Completion reason used when the oracle gives none.
const DEFAULT_COMPLETION_REASON: &str = "Task complete";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to write iteration log: {0}")]
    Log(#[source] std::io::Error),
    #[error("file history is inconsistent: {0}")]
    History(#[from] HistoryError),
    #[error("question channel closed: {0}")]
    QuestionChannel(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: u32,
    pub selector_limits: SelectorLimits,
    /// Iteration log location.
    pub history_file: PathBuf,
}

impl EngineConfig {
    /// Build from `config`. A relative `history_file` is taken from the project root.
    pub fn from_config(config: &Config, project_root: &Path) -> Self {
        Self {
            max_iterations: config.max_iterations,
            selector_limits: SelectorLimits::from_config(config),
            history_file: project_root.join(&config.history_file),
        }
    }
}

/// Engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Selecting,
    Generating,
    Executing,
    Analyzing,
    Complete,
    Exhausted,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Selecting => "selecting",
            Self::Generating => "generating",
            Self::Executing => "executing",
            Self::Analyzing => "analyzing",
            Self::Complete => "complete",
            Self::Exhausted => "exhausted",
        }
    }
}

/// Counts iterations against a fixed maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    max: u32,
    used: u32,
}

impl IterationBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Whether another iteration should start. Always false once `complete`.
    pub fn should_continue(&self, complete: bool) -> bool {
        !complete && self.used < self.max
    }

    /// Consume one iteration and return its 1-based number.
    pub fn start_iteration(&mut self) -> u32 {
        self.used += 1;
        self.used
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { reason: String },
    Exhausted { max_iterations: u32 },
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct TerminationReport {
    pub run_id: Id,
    pub outcome: RunOutcome,
    pub iterations: u32,
    /// One line per iteration.
    pub summaries: Vec<String>,
    pub task: Task,
}

impl TerminationReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed { .. })
    }
}

/// Mutable state of one run.
#[derive(Debug)]
struct RunState {
    task: Task,
    budget: IterationBudget,
    /// Every tool result of the run so far, latest per key.
    tool_results: ToolResults,
    summaries: Vec<String>,
    clarifications: Vec<Clarification>,
    completion: Option<String>,
}

/// Runs tasks to completion against one oracle and project.
pub struct IterationEngine {
    oracle: OracleClient,
    selector: FileSelector,
    dispatcher: ToolDispatcher,
    asker: Arc<dyn Asker>,
    config: EngineConfig,
}

impl std::fmt::Debug for IterationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationEngine")
            .field("oracle", &self.oracle)
            .field("selector", &self.selector)
            .field("dispatcher", &self.dispatcher)
            .field("asker", &"dyn Asker")
            .field("config", &self.config)
            .finish()
    }
}

impl IterationEngine {
    pub fn new(
        oracle: OracleClient,
        selector: FileSelector,
        dispatcher: ToolDispatcher,
        asker: Arc<dyn Asker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            oracle,
            selector,
            dispatcher,
            asker,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `task` for at most `max_iterations` cycles.
    ///
    /// Oracle and tool failures are absorbed into the run. Only log I/O
    /// failures, history inconsistencies and a closed question channel abort it.
    pub async fn run(&self, task: Task, max_iterations: u32) -> Result<TerminationReport> {
        let run_id = Id::new();
        let started = Instant::now();
        let mut log = IterationLog::open(&self.config.history_file).map_err(EngineError::Log)?;
        log.write_row(
            &IterationRow::now(RowKind::RunStart)
                .with_message(format!("run={run_id} task={}", task.description)),
        )
        .map_err(EngineError::Log)?;
        info!(run_id = %run_id, max_iterations, "run started");

        let result = self.drive(&run_id, task, max_iterations, &mut log).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(report) => {
                let (kind, message) = match &report.outcome {
                    RunOutcome::Completed { reason } => (RowKind::RunComplete, reason.clone()),
                    RunOutcome::Exhausted { max_iterations } => (
                        RowKind::RunExhausted,
                        format!("max iterations ({max_iterations}) reached"),
                    ),
                };
                log.write_row(
                    &IterationRow::now(kind)
                        .with_iteration(report.iterations)
                        .with_duration_ms(duration_ms)
                        .with_message(message),
                )
                .map_err(EngineError::Log)?;
                info!(
                    run_id = %run_id,
                    iterations = report.iterations,
                    success = report.is_success(),
                    duration_ms,
                    "run finished"
                );
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "run failed");
                let row = IterationRow::now(RowKind::RunFailed)
                    .with_duration_ms(duration_ms)
                    .with_message(err.to_string());
                if let Err(log_err) = log.write_row(&row) {
                    warn!(error = %log_err, "failed to record run failure");
                }
            }
        }
        result
    }

    async fn drive(
        &self,
        run_id: &Id,
        mut task: Task,
        max_iterations: u32,
        log: &mut IterationLog,
    ) -> Result<TerminationReport> {
        transition(run_id, 0, Phase::Selecting);
        let structure = self.selector.search().project_structure();
        let selected = self
            .selector
            .select(task.effective_description(), &structure, self.config.selector_limits)
            .await;
        info!(run_id = %run_id, files = selected.len(), "initial files selected");
        task.merge_files(selected.into_iter().map(File::from));

        let mut state = RunState {
            task,
            budget: IterationBudget::new(max_iterations),
            tool_results: ToolResults::new(),
            summaries: Vec::new(),
            clarifications: Vec::new(),
            completion: None,
        };

        while state.budget.should_continue(state.completion.is_some()) {
            let iteration = state.budget.start_iteration();
            let started = Instant::now();
            let row = self.iterate(run_id, iteration, &mut state).await?;
            log.write_row(&row.with_duration_ms(started.elapsed().as_millis() as u64))
                .map_err(EngineError::Log)?;
        }

        let outcome = match state.completion {
            Some(reason) => {
                transition(run_id, state.budget.used(), Phase::Complete);
                RunOutcome::Completed { reason }
            }
            None => {
                transition(run_id, state.budget.used(), Phase::Exhausted);
                RunOutcome::Exhausted {
                    max_iterations: state.budget.max(),
                }
            }
        };

        Ok(TerminationReport {
            run_id: run_id.clone(),
            outcome,
            iterations: state.budget.used(),
            summaries: state.summaries,
            task: state.task,
        })
    }

    /// One generate, execute, analyze cycle. Returns the log row for it.
    async fn iterate(&self, run_id: &Id, iteration: u32, state: &mut RunState) -> Result<IterationRow> {
        let row = IterationRow::now(RowKind::IterationEnd).with_iteration(iteration);

        transition(run_id, iteration, Phase::Generating);
        refresh_files(&mut state.task);
        let prompt = generation_prompt(
            &state.task,
            &state.tool_results,
            &state.summaries,
            &state.clarifications,
        );
        let response: OracleResponse = match self.oracle.call("generation", &prompt).await {
            Ok(response) => response,
            Err(err) => {
                warn!(run_id = %run_id, iteration, error = %err, "generation failed");
                let summary = format!("Iteration {iteration}: generation failed: {err}");
                state.summaries.push(summary.clone());
                return Ok(row.with_tools(0, 0).with_message(summary));
            }
        };

        self.handle_questions(iteration, &state.task, &response, &mut state.clarifications)
            .await?;

        transition(run_id, iteration, Phase::Executing);
        let mut results = ToolResults::new();
        if response.tool_usages.is_empty() {
            debug!(iteration, "no tool usages requested");
        } else {
            let outcome = self
                .dispatcher
                .run(&response.tool_usages, &state.task.relevant_files_history)
                .await;
            let previous = std::mem::take(&mut state.task.relevant_files_history);
            state.task.relevant_files_history = history::merge(previous, &outcome.updates)?;
            state.task.merge_files(outcome.new_files);
            let modified = read_files(&state.task.project_root, &outcome.modified_files);
            state.task.merge_files(modified);
            results.extend(outcome.results);
        }
        results.extend(self.dispatcher.run_standard_tools().await);

        let failed = results.values().filter(|r| !r.success).count();
        let executed = results.len();
        state.tool_results.extend(results);

        transition(run_id, iteration, Phase::Analyzing);
        let prompt = analysis_prompt(&state.task, &state.tool_results, &state.summaries);
        let analysis: OracleResponse = match self.oracle.call("analysis", &prompt).await {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(run_id = %run_id, iteration, error = %err, "analysis failed; treating as incomplete");
                OracleResponse::incomplete()
            }
        };

        if let Some(definition) = analysis
            .new_task_definition
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            info!(iteration, "task redefined by analysis");
            state.task.current_task_description = Some(definition.to_string());
        }
        if let Some(names) = &analysis.relevant_files {
            let files = read_files(&state.task.project_root, names);
            state.task.merge_files(files);
        }

        let mut summary = format!("Iteration {iteration}: {}", response.actions_summary);
        if analysis.actions_summary != DEFAULT_ACTIONS_SUMMARY {
            summary.push_str(&format!(" | Analysis: {}", analysis.actions_summary));
        }
        state.summaries.push(summary.clone());

        let row = row.with_tools(executed, failed).with_message(summary);

        if analysis.is_task_complete {
            let reason = analysis
                .completion_reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_COMPLETION_REASON.to_string());
            info!(run_id = %run_id, iteration, reason = %reason, "task complete");
            state.completion = Some(reason);
        }
        Ok(row)
    }

    async fn handle_questions(
        &self,
        iteration: u32,
        task: &Task,
        response: &OracleResponse,
        clarifications: &mut Vec<Clarification>,
    ) -> Result<()> {
        for question in response.pending_questions() {
            if !task.enable_questions {
                info!(iteration, question, "questions disabled; ignoring");
                continue;
            }
            let answer = self
                .asker
                .ask(question)
                .await
                .map_err(EngineError::QuestionChannel)?;
            debug!(iteration, question, "question answered");
            clarifications.push(Clarification {
                question: question.to_string(),
                answer,
            });
        }
        Ok(())
    }
}

fn transition(run_id: &Id, iteration: u32, phase: Phase) {
    info!(run_id = %run_id, iteration, phase = phase.as_str(), "phase transition");
}

/// Re-read every relevant file from disk.
fn refresh_files(task: &mut Task) {
    let root = task.project_root.clone();
    for file in &mut task.relevant_files {
        file.content_snippet = read_or_empty(&root, &file.file_name);
    }
}

/// Read named files, normalizing their names. Names outside the root are dropped.
fn read_files(root: &Path, names: &[String]) -> Vec<File> {
    names
        .iter()
        .filter_map(|name| match paths::normalize(root, name) {
            Ok(relative) => {
                let name = paths::display_name(&relative);
                let content = read_or_empty(root, &name);
                Some(File::new(name, content))
            }
            Err(err) => {
                warn!(name = %name, error = %err, "ignoring file");
                None
            }
        })
        .collect()
}

/// File content, or empty with a warning when it cannot be read.
fn read_or_empty(root: &Path, name: &str) -> String {
    let path = match paths::resolve(root, name) {
        Ok(path) => path,
        Err(err) => {
            warn!(name, error = %err, "ignoring file");
            return String::new();
        }
    };
    match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            warn!(name, error = %err, "file not readable; using empty content");
            String::new()
        }
    }
}
