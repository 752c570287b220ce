//! Shared fixtures: a scripted oracle, a scripted asker and project setup.

#![allow(dead_code)]

use async_trait::async_trait;
use forge::asker::Asker;
use forge::dispatcher::{DispatcherConfig, ToolDispatcher};
use forge::engine::{EngineConfig, IterationEngine};
use forge::oracle::{Oracle, OracleClient, OracleClientConfig, OracleError};
use forge::search::ProjectSearch;
use forge::selector::{FileSelector, SelectorLimits};
use forge_core::prompt::{ANALYSIS_HEADER, GENERATION_HEADER, SELECTION_HEADER};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Retries per oracle call in tests.
pub const ATTEMPTS: u32 = 2;

/// A reply that never parses.
pub const GARBAGE: &str = "I could not come up with an answer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Selection,
    Generation,
    Analysis,
}

impl Kind {
    fn of(prompt: &str) -> Self {
        if prompt.starts_with(SELECTION_HEADER) {
            Self::Selection
        } else if prompt.starts_with(GENERATION_HEADER) {
            Self::Generation
        } else if prompt.starts_with(ANALYSIS_HEADER) {
            Self::Analysis
        } else {
            panic!("unrecognized prompt: {}", prompt.lines().next().unwrap_or_default());
        }
    }

    fn fallback(self) -> &'static str {
        match self {
            Self::Selection => r#"{"allFilesFound": true}"#,
            Self::Generation => r#"{"isTaskComplete": false, "actionsSummary": "nothing to do"}"#,
            Self::Analysis => r#"{"isTaskComplete": false}"#,
        }
    }
}

/// Oracle replaying queued replies per prompt kind, with a benign fallback once a queue is empty.
#[derive(Default)]
pub struct ScriptedOracle {
    selection: Mutex<VecDeque<String>>,
    generation: Mutex<VecDeque<String>>,
    analysis: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<(Kind, String)>>,
}

impl ScriptedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue(&self, kind: Kind) -> &Mutex<VecDeque<String>> {
        match kind {
            Kind::Selection => &self.selection,
            Kind::Generation => &self.generation,
            Kind::Analysis => &self.analysis,
        }
    }

    pub fn push(&self, kind: Kind, reply: &Value) -> &Self {
        self.queue(kind).lock().unwrap().push_back(reply.to_string());
        self
    }

    /// Make the next call of `kind` fail on every attempt.
    pub fn fail(&self, kind: Kind) -> &Self {
        let mut queue = self.queue(kind).lock().unwrap();
        for _ in 0..ATTEMPTS {
            queue.push_back(GARBAGE.to_string());
        }
        drop(queue);
        self
    }

    pub fn prompts(&self, kind: Kind) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn send_prompt(&self, prompt: &str, _cacheable: bool) -> Result<String, OracleError> {
        let kind = Kind::of(prompt);
        self.prompts.lock().unwrap().push((kind, prompt.to_string()));
        let reply = self.queue(kind).lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| kind.fallback().to_string()))
    }
}

/// Asker replaying queued answers; errors once they run out.
#[derive(Default)]
pub struct ScriptedAsker {
    answers: Mutex<VecDeque<String>>,
    pub questions: Mutex<Vec<String>>,
}

impl ScriptedAsker {
    pub fn with_answers(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(ToString::to_string).collect()),
            questions: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Asker for ScriptedAsker {
    async fn ask(&self, question: &str) -> std::io::Result<String> {
        self.questions.lock().unwrap().push(question.to_string());
        self.answers.lock().unwrap().pop_front().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no more answers")
        })
    }
}

/// Temporary project with an installed dependency directory.
pub fn project(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("node_modules")).unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    dir
}

pub fn client(oracle: Arc<ScriptedOracle>) -> OracleClient {
    OracleClient::new(
        oracle,
        OracleClientConfig {
            attempts: ATTEMPTS,
            backoff: Duration::ZERO,
            failure_dir: None,
        },
    )
}

pub fn selector(root: &Path, oracle: Arc<ScriptedOracle>) -> FileSelector {
    let search = ProjectSearch::new(root, vec!["node_modules".into(), ".git".into()]).unwrap();
    FileSelector::new(client(oracle), search)
}

pub fn history_file(root: &Path) -> PathBuf {
    root.join("logs").join("task_history.tsv")
}

pub fn engine(root: &Path, oracle: Arc<ScriptedOracle>, asker: Arc<ScriptedAsker>) -> IterationEngine {
    let dispatcher = ToolDispatcher::new(
        root,
        DispatcherConfig {
            package_manager: "true".into(),
            dependency_dir: "node_modules".into(),
            standard_cmds: vec!["true".into()],
            command_timeout: Duration::from_secs(5),
        },
    );
    IterationEngine::new(
        client(Arc::clone(&oracle)),
        selector(root, oracle),
        dispatcher,
        asker,
        EngineConfig {
            max_iterations: 10,
            selector_limits: SelectorLimits {
                max_iterations: 3,
                max_files: 10,
                max_total_size: 10_000,
            },
            history_file: history_file(root),
        },
    )
}

/// Kinds of the rows written to the iteration log, header excluded.
pub fn log_kinds(root: &Path) -> Vec<String> {
    std::fs::read_to_string(history_file(root))
        .unwrap()
        .lines()
        .skip(1)
        .map(|line| line.split('\t').nth(1).unwrap().to_string())
        .collect()
}
