//! Relevant-file discovery.
//!
//! The selector asks the oracle which files matter for a task, runs the static
//! searches it requests and reads the files it suggests. Everything admitted
//! goes through one `FileBudget`, so the file count and total size limits hold
//! whatever the oracle answers.

use crate::oracle::OracleClient;
use crate::paths;
use crate::search::{is_node_builtin, ProjectSearch, SearchTool};
use forge_core::prompt::selection_prompt;
use forge_core::{Config, File, ScoredFile, SelectionResponse};
use tracing::{debug, info, warn};

/// Highest relevance score the oracle may assign.
pub const MAX_SCORE: u8 = 10;

/// Selection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorLimits {
    /// Oracle rounds before giving up.
    pub max_iterations: u32,
    pub max_files: usize,
    /// Total content bytes across all selected files.
    pub max_total_size: usize,
}

impl Default for SelectorLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SelectorLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.selector_iterations,
            max_files: config.max_files,
            max_total_size: config.max_total_size,
        }
    }
}

/// A file chosen for the task. Empty content with size 0 marks a file to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub content: String,
    pub size: usize,
    pub score: Option<u8>,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>, score: Option<u8>) -> Self {
        let content = content.into();
        Self {
            name: name.into(),
            size: content.len(),
            content,
            score: score.map(|s| s.min(MAX_SCORE)),
        }
    }

    /// Placeholder for a suggested file that does not exist yet.
    pub fn placeholder(name: impl Into<String>, score: u8) -> Self {
        Self::new(name, String::new(), Some(score))
    }
}

impl From<SelectedFile> for File {
    fn from(selected: SelectedFile) -> Self {
        File::new(selected.name, selected.content)
    }
}

/// Why `FileBudget::admit` accepted or refused a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Duplicate,
    TooManyFiles,
    TooLarge,
}

/// Collected files plus the limits they must respect.
#[derive(Debug, Clone)]
pub struct FileBudget {
    limits: SelectorLimits,
    files: Vec<SelectedFile>,
    total_size: usize,
}

impl FileBudget {
    pub fn new(limits: SelectorLimits) -> Self {
        Self {
            limits,
            files: Vec::new(),
            total_size: 0,
        }
    }

    /// Admit `file` if it is new and fits. Over-budget files are skipped, never truncated.
    pub fn admit(&mut self, file: SelectedFile) -> Admission {
        if self.contains(&file.name) {
            return Admission::Duplicate;
        }
        if self.files.len() >= self.limits.max_files {
            return Admission::TooManyFiles;
        }
        if self.total_size + file.size > self.limits.max_total_size {
            return Admission::TooLarge;
        }
        self.total_size += file.size;
        self.files.push(file);
        Admission::Admitted
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.iter().any(|f| f.name == name)
    }

    /// Raise the score of an already collected file.
    fn rescore(&mut self, name: &str, score: u8) {
        if let Some(file) = self.files.iter_mut().find(|f| f.name == name) {
            let score = score.min(MAX_SCORE);
            if file.score.is_none_or(|current| current < score) {
                file.score = Some(score);
            }
        }
    }

    /// No further file can be admitted.
    pub fn is_exhausted(&self) -> bool {
        self.files.len() >= self.limits.max_files || self.total_size >= self.limits.max_total_size
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn files(&self) -> &[SelectedFile] {
        &self.files
    }

    /// Files by descending score. Unscored files count as 0; ties keep admission order.
    pub fn into_sorted(self) -> Vec<SelectedFile> {
        let mut files = self.files;
        files.sort_by(|a, b| b.score.unwrap_or(0).cmp(&a.score.unwrap_or(0)));
        files
    }
}

/// Oracle-guided file selection over one project.
#[derive(Debug)]
pub struct FileSelector {
    oracle: OracleClient,
    search: ProjectSearch,
}

impl FileSelector {
    pub fn new(oracle: OracleClient, search: ProjectSearch) -> Self {
        Self { oracle, search }
    }

    pub fn search(&self) -> &ProjectSearch {
        &self.search
    }

    /// Collect the files relevant to `task_description`.
    ///
    /// Stops when the oracle reports all files found, after `limits.max_iterations`
    /// rounds, when the budget is exhausted, or when an oracle call fails.
    pub async fn select(
        &self,
        task_description: &str,
        project_structure: &str,
        limits: SelectorLimits,
    ) -> Vec<SelectedFile> {
        let mut budget = FileBudget::new(limits);

        for round in 1..=limits.max_iterations {
            if budget.is_exhausted() {
                info!(round, files = budget.len(), "file budget exhausted");
                break;
            }

            let collected: Vec<File> = budget.files().iter().cloned().map(File::from).collect();
            let prompt = selection_prompt(task_description, &collected, project_structure);
            let response: SelectionResponse = match self.oracle.call("file selection", &prompt).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(round, error = %err, "file selection failed; keeping collected files");
                    break;
                }
            };
            if !response.reasoning.is_empty() {
                debug!(round, reasoning = %response.reasoning, "selection reasoning");
            }

            self.admit_search_results(&response, &mut budget);
            self.admit_suggestions(&response.relevant_files, &mut budget);

            info!(
                round,
                files = budget.len(),
                total_size = budget.total_size(),
                all_found = response.all_files_found,
                "selection round finished"
            );
            if response.all_files_found {
                break;
            }
        }

        budget.into_sorted()
    }

    fn admit_search_results(&self, response: &SelectionResponse, budget: &mut FileBudget) {
        for request in &response.tools {
            let tool = match SearchTool::from_request(request) {
                Ok(tool) => tool,
                Err(err) => {
                    warn!(tool = %request.name, error = %err, "skipping search request");
                    continue;
                }
            };
            let found = match self.search.run(&tool) {
                Ok(found) => found,
                Err(err) => {
                    warn!(tool = tool.name(), error = %err, "search failed");
                    continue;
                }
            };

            for name in found {
                if budget.is_exhausted() {
                    return;
                }
                if is_node_builtin(&name) || budget.contains(&name) {
                    continue;
                }
                let Ok(Some(located)) = self.search.locate(&name) else {
                    debug!(name = %name, "search result is not a project file");
                    continue;
                };
                if let Some(content) = self.read(&located) {
                    let admission = budget.admit(SelectedFile::new(located.clone(), content, None));
                    debug!(name = %located, ?admission, tool = tool.name(), "search result");
                }
            }
        }
    }

    fn admit_suggestions(&self, suggestions: &[ScoredFile], budget: &mut FileBudget) {
        let mut ordered: Vec<&ScoredFile> = suggestions.iter().collect();
        ordered.sort_by(|a, b| b.score.cmp(&a.score));

        for suggestion in ordered {
            if is_node_builtin(&suggestion.name) {
                continue;
            }
            let file = match self.search.locate(&suggestion.name) {
                Ok(Some(located)) => {
                    if budget.contains(&located) {
                        budget.rescore(&located, suggestion.score);
                        continue;
                    }
                    let Some(content) = self.read(&located) else {
                        continue;
                    };
                    SelectedFile::new(located, content, Some(suggestion.score))
                }
                Ok(None) => {
                    let Ok(relative) = paths::normalize(self.search.root(), &suggestion.name)
                    else {
                        continue;
                    };
                    SelectedFile::placeholder(paths::display_name(&relative), suggestion.score)
                }
                Err(err) => {
                    warn!(name = %suggestion.name, error = %err, "rejecting suggested file");
                    continue;
                }
            };

            let name = file.name.clone();
            match budget.admit(file) {
                Admission::Admitted => debug!(name = %name, score = suggestion.score, "admitted suggestion"),
                Admission::Duplicate => budget.rescore(&name, suggestion.score),
                refused => debug!(name = %name, ?refused, "suggestion over budget"),
            }
            if budget.is_exhausted() {
                return;
            }
        }
    }

    fn read(&self, name: &str) -> Option<String> {
        match std::fs::read_to_string(self.search.root().join(name)) {
            Ok(content) => Some(content),
            Err(err) => {
                warn!(name, error = %err, "cannot read file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_files: usize, max_total_size: usize) -> SelectorLimits {
        SelectorLimits {
            max_iterations: 5,
            max_files,
            max_total_size,
        }
    }

    #[test]
    fn budget_enforces_count_and_size() {
        let mut budget = FileBudget::new(limits(3, 10));
        assert_eq!(budget.admit(SelectedFile::new("a", "123456", None)), Admission::Admitted);
        assert_eq!(budget.admit(SelectedFile::new("a", "1", None)), Admission::Duplicate);
        assert_eq!(budget.admit(SelectedFile::new("b", "12345", None)), Admission::TooLarge);
        assert_eq!(budget.admit(SelectedFile::new("c", "1234", None)), Admission::Admitted);
        assert_eq!(budget.total_size(), 10);
        assert!(budget.is_exhausted());
        assert_eq!(budget.admit(SelectedFile::placeholder("d", 5)), Admission::Admitted);
        assert_eq!(budget.admit(SelectedFile::placeholder("e", 5)), Admission::TooManyFiles);
        assert_eq!(budget.len(), 3);
    }

    #[test]
    fn sorted_output_keeps_ties_in_order() {
        let mut budget = FileBudget::new(limits(10, 100));
        budget.admit(SelectedFile::new("tool", "t", None));
        budget.admit(SelectedFile::new("low", "l", Some(3)));
        budget.admit(SelectedFile::new("high", "h", Some(9)));
        budget.admit(SelectedFile::new("also-high", "h", Some(9)));
        let names: Vec<_> = budget.into_sorted().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["high", "also-high", "low", "tool"]);
    }

    #[test]
    fn rescore_only_raises() {
        let mut budget = FileBudget::new(limits(10, 100));
        budget.admit(SelectedFile::new("a", "", None));
        budget.rescore("a", 4);
        budget.rescore("a", 2);
        assert_eq!(budget.files()[0].score, Some(4));
        budget.rescore("a", 200);
        assert_eq!(budget.files()[0].score, Some(MAX_SCORE));
    }

    #[test]
    fn placeholder_is_empty() {
        let file = SelectedFile::placeholder("src/new.ts", 7);
        assert_eq!(file.size, 0);
        assert!(file.content.is_empty());
        assert_eq!(File::from(file), File::new("src/new.ts", ""));
    }
}
