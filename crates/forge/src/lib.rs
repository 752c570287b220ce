//! forge - oracle-driven code iteration engine
//!
//! Selects the files relevant to a task, then repeatedly asks an oracle for
//! tool usages, executes them against the project and asks the oracle to
//! judge the result, until the task is complete or the budget runs out.

pub mod asker;
pub mod dispatcher;
pub mod engine;
pub mod oracle;
pub mod paths;
pub mod process;
pub mod search;
pub mod selector;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use asker::Asker;
use dispatcher::{DispatcherConfig, ToolDispatcher};
use engine::{EngineConfig, IterationEngine, TerminationReport};
use forge_core::{Config, Task};
use oracle::{CommandOracle, Oracle, OracleClient, OracleClientConfig};
use search::ProjectSearch;
use selector::FileSelector;
use tracing::info;

/// A fully wired engine for one project.
#[derive(Debug)]
pub struct Forge {
    config: Config,
    project_root: PathBuf,
    engine: IterationEngine,
}

impl Forge {
    /// Wire every component from `config`.
    pub fn new(
        config: Config,
        project_root: &Path,
        oracle: Arc<dyn Oracle>,
        asker: Arc<dyn Asker>,
    ) -> search::Result<Self> {
        let client = OracleClient::new(oracle, OracleClientConfig::from_config(&config));
        let search = ProjectSearch::new(project_root, config.ignored_dirs.clone())?;
        let engine = IterationEngine::new(
            client.clone(),
            FileSelector::new(client, search),
            ToolDispatcher::new(project_root, DispatcherConfig::from_config(&config)),
            asker,
            EngineConfig::from_config(&config, project_root),
        );
        Ok(Self {
            config,
            project_root: project_root.to_path_buf(),
            engine,
        })
    }

    /// Wire with the configured oracle command.
    pub fn with_command_oracle(
        config: Config,
        project_root: &Path,
        asker: Arc<dyn Asker>,
    ) -> search::Result<Self> {
        info!(cmd = %config.oracle_cmd, "using command oracle");
        let oracle = Arc::new(CommandOracle::from_config(&config, project_root));
        Self::new(config, project_root, oracle, asker)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh task for this project.
    pub fn task(&self, description: &str) -> Task {
        let mut task = Task::new(description, &self.project_root);
        task.enable_questions = self.config.enable_questions;
        task
    }

    /// Run `description` to completion or exhaustion.
    pub async fn run(&self, description: &str) -> engine::Result<TerminationReport> {
        self.engine
            .run(self.task(description), self.config.max_iterations)
            .await
    }
}
