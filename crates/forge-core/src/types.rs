//! Core types for the iteration engine.
//!
//! Oracle-facing types use camelCase on the wire because that is the shape the
//! prompts ask the oracle to produce.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for runs.
/// Uses `UUIDv7` so run ids sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Task and files ---

/// A project file as last read from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Path relative to the project root. Unique within a task.
    pub file_name: String,
    /// Full text content at time of read.
    pub content_snippet: String,
}

impl File {
    pub fn new(file_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            content_snippet: content.into(),
        }
    }
}

/// One transition between two consecutive versions of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from_version: u32,
    pub to_version: u32,
    /// `+`/`-` prefixed changed lines, no context.
    pub diff: String,
    pub comment: String,
}

/// Append-only version ledger for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHistory {
    pub file_name: String,
    /// 0 means untouched.
    pub current_version: u32,
    pub version_diffs: Vec<VersionDiff>,
}

impl FileHistory {
    /// Check ordering, contiguity and that `current_version` matches the last diff.
    pub fn is_consistent(&self) -> bool {
        let mut expected_from = 0;
        for diff in &self.version_diffs {
            if diff.from_version != expected_from || diff.to_version != diff.from_version + 1 {
                return false;
            }
            expected_from = diff.to_version;
        }
        self.current_version == expected_from
    }
}

/// A single file change produced by the dispatcher, consumed by the history tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpdate {
    pub file_name: String,
    pub from_version: u32,
    pub new_version: u32,
    pub diff: String,
    pub comment: String,
}

/// The mutable unit of work tracked across iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    /// Set by the analysis phase; overrides `description` when prompting.
    pub current_task_description: Option<String>,
    pub relevant_files: Vec<File>,
    pub project_root: PathBuf,
    pub enable_questions: bool,
    pub relevant_files_history: Vec<FileHistory>,
}

impl Task {
    pub fn new(description: impl Into<String>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            description: description.into(),
            current_task_description: None,
            relevant_files: Vec::new(),
            project_root: project_root.into(),
            enable_questions: true,
            relevant_files_history: Vec::new(),
        }
    }

    /// The description to show the oracle.
    pub fn effective_description(&self) -> &str {
        self.current_task_description
            .as_deref()
            .unwrap_or(&self.description)
    }

    /// Replace or insert files by name. Later entries win.
    pub fn merge_files(&mut self, files: impl IntoIterator<Item = File>) {
        for file in files {
            match self
                .relevant_files
                .iter_mut()
                .find(|f| f.file_name == file.file_name)
            {
                Some(existing) => *existing = file,
                None => self.relevant_files.push(file),
            }
        }
    }

    /// Names of all relevant files, in order.
    pub fn file_names(&self) -> Vec<String> {
        self.relevant_files
            .iter()
            .map(|f| f.file_name.clone())
            .collect()
    }

    /// Current version of a file according to the history (0 if untouched).
    pub fn current_version(&self, file_name: &str) -> u32 {
        current_version(&self.relevant_files_history, file_name)
    }
}

/// Current version of `file_name` in `history` (0 if absent).
pub fn current_version(history: &[FileHistory], file_name: &str) -> u32 {
    history
        .iter()
        .find(|h| h.file_name == file_name)
        .map_or(0, |h| h.current_version)
}

// --- Tool usages and results ---

/// An operation requested by the oracle, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolUsage {
    pub name: String,
    #[serde(deserialize_with = "string_map")]
    pub params: BTreeMap<String, String>,
    pub reasoning: String,
}

impl ToolUsage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the reasoning text.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Key used in tool result maps: `name|k=v,k=v` with params sorted by key.
    pub fn result_key(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}|{}", self.name, params)
    }
}

/// Outcome of a single executed tool usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    /// The command was killed by its timeout rather than exiting.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl ToolResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            timed_out: true,
        }
    }
}

/// Tool results keyed by `ToolUsage::result_key` or standard tool name.
pub type ToolResults = BTreeMap<String, ToolResult>;

// --- Oracle responses ---

pub const DEFAULT_ACTIONS_SUMMARY: &str = "No actions summary provided";

fn default_actions_summary() -> String {
    DEFAULT_ACTIONS_SUMMARY.to_string()
}

/// Canonical response for both generation and analysis calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OracleResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_usages: Vec<ToolUsage>,
    #[serde(default)]
    pub questions: Option<Vec<String>>,
    pub is_task_complete: bool,
    #[serde(default)]
    pub completion_reason: Option<String>,
    #[serde(default = "default_actions_summary", deserialize_with = "summary_or_default")]
    pub actions_summary: String,
    #[serde(default)]
    pub relevant_files: Option<Vec<String>>,
    #[serde(default)]
    pub new_task_definition: Option<String>,
}

impl OracleResponse {
    /// An empty, incomplete response.
    pub fn incomplete() -> Self {
        Self {
            tool_usages: Vec::new(),
            questions: None,
            is_task_complete: false,
            completion_reason: None,
            actions_summary: default_actions_summary(),
            relevant_files: None,
            new_task_definition: None,
        }
    }

    /// Questions, ignoring blank entries.
    pub fn pending_questions(&self) -> impl Iterator<Item = &str> {
        self.questions
            .iter()
            .flatten()
            .map(String::as_str)
            .filter(|q| !q.trim().is_empty())
    }
}

/// A file suggested by the oracle during selection, with relevance 1..=10.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredFile {
    pub name: String,
    #[serde(default)]
    pub score: u8,
}

/// A static-analysis search requested during selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub name: String,
    #[serde(deserialize_with = "string_map")]
    pub params: BTreeMap<String, String>,
}

/// Response to the file selection prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionResponse {
    #[serde(default)]
    pub all_files_found: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tools: Vec<SearchRequest>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub relevant_files: Vec<ScoredFile>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reasoning: String,
}

/// A question raised by the oracle and the answer given to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    pub answer: String,
}

// --- serde helpers ---

/// Accept string, number, bool or null values and store them as strings.
fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, value)
        })
        .collect())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn summary_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let summary: Option<String> = Option::deserialize(deserializer)?;
    Ok(summary
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(default_actions_summary))
}
