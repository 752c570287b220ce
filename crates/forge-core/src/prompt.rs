//! Prompt assembly for the selection, generation and analysis phases.
//!
//! Each prompt opens with a fixed header line so the phase is recognizable in
//! logs and by scripted oracles.

use crate::types::{Clarification, File, Task, ToolResults};

pub const SELECTION_HEADER: &str = "# forge: file selection";
pub const GENERATION_HEADER: &str = "# forge: code generation";
pub const ANALYSIS_HEADER: &str = "# forge: result analysis";

/// Maximum characters of each already-collected file shown during selection.
pub const SELECTION_SNIPPET_CHARS: usize = 2000;

/// Static-analysis tools offered to the oracle during file selection.
pub const SEARCH_TOOLS: &[(&str, &str)] = &[
    ("findFilesByName", "Find files with a specific name or glob pattern. params: pattern"),
    ("findFilesByContent", "Find files containing specific text. params: pattern"),
    ("findImportedFiles", "Find files imported by a file. params: file"),
    ("findRelatedTests", "Find test files for a given file. params: file"),
    ("findComponentUsage", "Find files where a component is used. params: component"),
    ("findAPIUsage", "Find files that fetch a specific API endpoint. params: endpoint"),
    ("findStyleDependencies", "Find CSS/SCSS files imported by a component. params: component"),
    ("findFunctionDefinition", "Find the file defining a function. params: functionName"),
    ("findDependencies", "List the import specifiers of a file. params: file"),
    ("findRecentlyModifiedFiles", "Find files modified in the last N days. params: days"),
    ("findRelatedClasses", "Find imported and base-class files of a file. params: file"),
];

const SELECTION_INSTRUCTIONS: &str = "\
Analyze the task and suggest tools to find relevant files. Include previously found files in your response.
For TypeScript files, use findRelatedClasses to follow base classes, imported classes and subclasses.
Include in relevantFiles any file you believe is relevant, even if it does not exist yet.
Give each file a relevance score from 1 to 10 (10 is most relevant) and sort by score, descending.
Ignore Node.js built-in modules, the node_modules directory and files outside the project.
If all necessary files are found, set allFilesFound to true.
Respond with a single JSON object:
{ \"allFilesFound\": boolean, \"tools\": [{ \"name\": string, \"params\": object }], \"relevantFiles\": [{ \"name\": string, \"score\": number }], \"reasoning\": \"file1 (Score: 9): reason1\\nfile2 (Score: 8): reason2\" }";

const GENERATION_FORMAT: &str = r#"Respond with a single JSON object with this structure:

{
  "toolUsages": [
    {
      "name": "toolName",
      "params": { "param1": "value1" },
      "reasoning": "Why this tool is used"
    }
  ],
  "questions": ["Questions for the user, if any"],
  "isTaskComplete": false,
  "completionReason": "Only when isTaskComplete is true",
  "actionsSummary": "A brief summary of the actions taken in this iteration"
}"#;

const TOOL_INSTRUCTIONS: &str = r#"Available tools:
- updateFile { fileName, content }: create or replace a file with the full new content.
- moveFile { source, destination }: move or rename a file.
- deleteFile { fileName }: delete a file.
- requestFiles { filePattern }: read files matching a glob pattern into the next iteration.
- yarn { command }: run an arbitrary package manager command.
- yarnInstall, yarnBuild, yarnTest: install dependencies, build, run tests.
- yarnAdd { package }: add a dependency.
- removeModules: delete the installed dependencies directory.

Important instructions:
1. Paths are relative to the project root.
2. Prefix each question with a running number ("1. ", "2. ", ...).
3. If you ask questions, set "isTaskComplete" to false and leave "completionReason" empty.
4. Only set "isTaskComplete" to true when the entire task is done and you have no questions.
5. Summarize this iteration in "actionsSummary"."#;

const ANALYSIS_FORMAT: &str = r#"Respond with a single JSON object with this structure:

{
  "toolUsages": [],
  "questions": [],
  "isTaskComplete": false,
  "completionReason": null,
  "actionsSummary": "A brief summary of the analysis and suggested actions",
  "relevantFiles": ["Files that need attention"],
  "newTaskDefinition": "A refined task definition, if needed"
}

Important instructions:
1. Leave "questions" and "toolUsages" empty.
2. Set "isTaskComplete" to true only if the entire task is complete.
3. List files that need attention in "relevantFiles".
4. Provide "newTaskDefinition" only when the remaining work differs from the task description."#;

/// Prompt for one round of file selection.
///
/// Collected file contents are truncated to `SELECTION_SNIPPET_CHARS`.
pub fn selection_prompt(task: &str, collected: &[File], project_structure: &str) -> String {
    let files: Vec<_> = collected
        .iter()
        .map(|f| {
            serde_json::json!({
                "name": f.file_name,
                "content": truncate_chars(&f.content_snippet, SELECTION_SNIPPET_CHARS),
            })
        })
        .collect();
    let tools: Vec<_> = SEARCH_TOOLS
        .iter()
        .map(|(name, description)| serde_json::json!({ "name": name, "description": description }))
        .collect();

    let payload = serde_json::json!({
        "task": task,
        "relevantFiles": files,
        "projectStructure": project_structure,
        "instructions": SELECTION_INSTRUCTIONS,
        "availableTools": tools,
    });

    format!("{SELECTION_HEADER}\n{payload:#}\n")
}

/// Prompt asking the oracle for tool usages that advance the task.
pub fn generation_prompt(
    task: &Task,
    tool_results: &ToolResults,
    history: &[String],
    clarifications: &[Clarification],
) -> String {
    let mut prompt = format!(
        "{GENERATION_HEADER}\n\nYou are an assistant specialized in TypeScript development. \
         Generate or update code to accomplish the task below.\n\n\
         Task Description: {}\n\nRelevant Files:\n{}\n",
        task.effective_description(),
        render_files(&task.relevant_files),
    );

    if !tool_results.is_empty() {
        prompt.push_str(&format!(
            "\nPrevious Tool Results:\n{}\n",
            render_tool_results(tool_results)
        ));
    }

    if !history.is_empty() {
        prompt.push_str(&format!("\nTask History:\n{}\n", history.join("\n")));
    }

    if !clarifications.is_empty() {
        let pairs = clarifications
            .iter()
            .map(|c| format!("Q: {}\nA: {}", c.question, c.answer))
            .collect::<Vec<_>>()
            .join("\n\n");
        prompt.push_str(&format!("\nAdditional Clarifications:\n{pairs}\n"));
    }

    prompt.push_str(&format!("\n{GENERATION_FORMAT}\n\n{TOOL_INSTRUCTIONS}\n"));
    prompt
}

/// Prompt asking the oracle to judge the state after tools ran.
pub fn analysis_prompt(task: &Task, tool_results: &ToolResults, history: &[String]) -> String {
    let mut prompt = format!(
        "{ANALYSIS_HEADER}\n\nYou are an assistant specialized in analyzing TypeScript \
         development results. Analyze the latest code changes and tool outputs.\n\n\
         Task Description: {}\n\nCurrent Files:\n{}\n\nTool Results:\n{}\n",
        task.effective_description(),
        render_files(&task.relevant_files),
        render_tool_results(tool_results),
    );

    if !history.is_empty() {
        prompt.push_str(&format!("\nTask History:\n{}\n", history.join("\n")));
    }

    prompt.push_str(&format!("\n{ANALYSIS_FORMAT}\n"));
    prompt
}

fn render_files(files: &[File]) -> String {
    if files.is_empty() {
        return "(none)".to_string();
    }
    files
        .iter()
        .map(|f| format!("{}:\n{}", f.file_name, f.content_snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_tool_results(results: &ToolResults) -> String {
    if results.is_empty() {
        return "(none)".to_string();
    }
    results
        .iter()
        .map(|(key, result)| {
            let status = if result.timed_out {
                "timed out"
            } else if result.success {
                "ok"
            } else {
                "failed"
            };
            format!("{key} [{status}]:\n{}", result.message)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_chars(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
