//! End-to-end runs of the iteration engine against a scripted oracle.

mod common;

use common::{engine, log_kinds, project, Kind, ScriptedAsker, ScriptedOracle};
use forge::engine::{EngineError, RunOutcome};
use forge_core::{File, Task};
use serde_json::json;

fn task(root: &std::path::Path) -> Task {
    Task::new("add a greeting module", root)
}

#[tokio::test]
async fn never_complete_runs_exactly_max_iterations() {
    let dir = project(&[("src/index.ts", "export {};\n")]);
    let oracle = ScriptedOracle::new();
    let engine = engine(dir.path(), oracle.clone(), ScriptedAsker::with_answers(&[]));

    let report = engine.run(task(dir.path()), 3).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted { max_iterations: 3 });
    assert!(!report.is_success());
    assert_eq!(report.iterations, 3);
    assert_eq!(report.summaries.len(), 3);
    assert_eq!(report.summaries[0], "Iteration 1: nothing to do");
    assert_eq!(oracle.prompts(Kind::Generation).len(), 3);
    assert_eq!(oracle.prompts(Kind::Analysis).len(), 3);
    assert_eq!(
        log_kinds(dir.path()),
        vec!["RUN_START", "ITERATION_END", "ITERATION_END", "ITERATION_END", "RUN_EXHAUSTED"]
    );
}

#[tokio::test]
async fn first_analysis_completion_stops_after_one_cycle() {
    let dir = project(&[]);
    let oracle = ScriptedOracle::new();
    oracle.push(
        Kind::Analysis,
        &json!({"isTaskComplete": true, "completionReason": "done"}),
    );
    let engine = engine(dir.path(), oracle.clone(), ScriptedAsker::with_answers(&[]));

    let report = engine.run(task(dir.path()), 5).await.unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Completed {
            reason: "done".into()
        }
    );
    assert_eq!(report.iterations, 1);
    assert_eq!(oracle.prompts(Kind::Generation).len(), 1);
    assert_eq!(
        log_kinds(dir.path()),
        vec!["RUN_START", "ITERATION_END", "RUN_COMPLETE"]
    );
}

#[tokio::test]
async fn selected_files_reach_the_generation_prompt() {
    let dir = project(&[("src/greet.ts", "export const hello = 1;\n")]);
    let oracle = ScriptedOracle::new();
    oracle.push(
        Kind::Selection,
        &json!({"allFilesFound": true, "relevantFiles": [{"name": "src/greet.ts", "score": 9}]}),
    );
    oracle.push(Kind::Analysis, &json!({"isTaskComplete": true}));
    let engine = engine(dir.path(), oracle.clone(), ScriptedAsker::with_answers(&[]));

    let report = engine.run(task(dir.path()), 2).await.unwrap();

    assert!(report.is_success());
    assert_eq!(
        report.task.relevant_files,
        vec![File::new("src/greet.ts", "export const hello = 1;\n")]
    );
    let generation = &oracle.prompts(Kind::Generation)[0];
    assert!(generation.contains("src/greet.ts:\nexport const hello = 1;"));
}

#[tokio::test]
async fn update_file_is_tracked_in_history() {
    let dir = project(&[]);
    let oracle = ScriptedOracle::new();
    oracle.push(
        Kind::Generation,
        &json!({
            "toolUsages": [{
                "name": "updateFile",
                "params": {"fileName": "foo.ts", "content": "x"},
                "reasoning": "create foo"
            }],
            "isTaskComplete": false,
            "actionsSummary": "created foo.ts"
        }),
    );
    oracle.push(Kind::Analysis, &json!({"isTaskComplete": true, "completionReason": "foo exists"}));
    let engine = engine(dir.path(), oracle.clone(), ScriptedAsker::with_answers(&[]));

    let report = engine.run(task(dir.path()), 3).await.unwrap();

    assert_eq!(std::fs::read_to_string(dir.path().join("foo.ts")).unwrap(), "x");
    let history = &report.task.relevant_files_history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].file_name, "foo.ts");
    assert_eq!(history[0].current_version, 1);
    assert_eq!(history[0].version_diffs.len(), 1);
    assert_eq!(history[0].version_diffs[0].from_version, 0);
    assert_eq!(history[0].version_diffs[0].to_version, 1);
    assert_eq!(history[0].version_diffs[0].diff, "+x");
    assert_eq!(
        history[0].version_diffs[0].comment,
        "Update from tool execution: create foo"
    );
    assert!(report.task.relevant_files.contains(&File::new("foo.ts", "x")));

    let analysis = &oracle.prompts(Kind::Analysis)[0];
    assert!(analysis.contains("updateFile|content=x,fileName=foo.ts [ok]"));
    assert!(analysis.contains("true [ok]"));
}

#[tokio::test]
async fn tool_results_accumulate_across_iterations() {
    let dir = project(&[]);
    let oracle = ScriptedOracle::new();
    oracle.push(
        Kind::Generation,
        &json!({
            "toolUsages": [{
                "name": "updateFile",
                "params": {"fileName": "src/new.ts", "content": "export {};"}
            }],
            "isTaskComplete": false
        }),
    );
    oracle.fail(Kind::Generation);
    let engine = engine(dir.path(), oracle.clone(), ScriptedAsker::with_answers(&[]));

    let report = engine.run(task(dir.path()), 3).await.unwrap();
    assert_eq!(report.iterations, 3);

    let update = "updateFile|content=export {};,fileName=src/new.ts [ok]";
    let analyses = oracle.prompts(Kind::Analysis);
    assert_eq!(analyses.len(), 2);
    assert!(analyses.iter().all(|prompt| prompt.contains(update)));
    let generations = oracle.prompts(Kind::Generation);
    assert!(generations[3].contains(update), "{}", generations[3]);
}

#[tokio::test]
async fn questions_are_answered_and_fed_back() {
    let dir = project(&[]);
    let oracle = ScriptedOracle::new();
    oracle.push(
        Kind::Generation,
        &json!({"questions": ["1. Which port?"], "isTaskComplete": false}),
    );
    let asker = ScriptedAsker::with_answers(&["8080"]);
    let engine = engine(dir.path(), oracle.clone(), asker.clone());

    let report = engine.run(task(dir.path()), 2).await.unwrap();

    assert_eq!(report.iterations, 2);
    assert_eq!(*asker.questions.lock().unwrap(), vec!["1. Which port?"]);
    let prompts = oracle.prompts(Kind::Generation);
    assert!(!prompts[0].contains("Additional Clarifications"));
    assert!(prompts[1].contains("Q: 1. Which port?\nA: 8080"));
}

#[tokio::test]
async fn disabled_questions_are_not_asked() {
    let dir = project(&[]);
    let oracle = ScriptedOracle::new();
    oracle.push(
        Kind::Generation,
        &json!({"questions": ["1. Which port?"], "isTaskComplete": false}),
    );
    let asker = ScriptedAsker::with_answers(&[]);
    let engine = engine(dir.path(), oracle.clone(), asker.clone());

    let mut task = task(dir.path());
    task.enable_questions = false;
    let report = engine.run(task, 1).await.unwrap();

    assert_eq!(report.iterations, 1);
    assert!(asker.questions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn closed_question_channel_aborts_the_run() {
    let dir = project(&[]);
    let oracle = ScriptedOracle::new();
    oracle.push(
        Kind::Generation,
        &json!({"questions": ["1. Which port?"], "isTaskComplete": false}),
    );
    let engine = engine(dir.path(), oracle, ScriptedAsker::with_answers(&[]));

    let err = engine.run(task(dir.path()), 3).await.unwrap_err();

    assert!(matches!(err, EngineError::QuestionChannel(_)));
    assert_eq!(log_kinds(dir.path()), vec!["RUN_START", "RUN_FAILED"]);
}

#[tokio::test]
async fn generation_failure_consumes_the_iteration() {
    let dir = project(&[]);
    let oracle = ScriptedOracle::new();
    oracle.fail(Kind::Generation);
    let engine = engine(dir.path(), oracle.clone(), ScriptedAsker::with_answers(&[]));

    let report = engine.run(task(dir.path()), 2).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Exhausted { max_iterations: 2 });
    assert_eq!(report.iterations, 2);
    assert!(report.summaries[0].starts_with("Iteration 1: generation failed"));
    assert_eq!(report.summaries[1], "Iteration 2: nothing to do");
    assert_eq!(oracle.prompts(Kind::Analysis).len(), 1);
}

#[tokio::test]
async fn analysis_failure_counts_as_incomplete() {
    let dir = project(&[]);
    let oracle = ScriptedOracle::new();
    oracle.fail(Kind::Analysis);
    oracle.push(Kind::Analysis, &json!({"isTaskComplete": true}));
    let engine = engine(dir.path(), oracle, ScriptedAsker::with_answers(&[]));

    let report = engine.run(task(dir.path()), 3).await.unwrap();

    assert_eq!(report.iterations, 2);
    assert_eq!(
        report.outcome,
        RunOutcome::Completed {
            reason: "Task complete".into()
        }
    );
}

#[tokio::test]
async fn analysis_redefines_task_and_adds_files() {
    let dir = project(&[("src/present.ts", "here")]);
    let oracle = ScriptedOracle::new();
    oracle.push(
        Kind::Analysis,
        &json!({
            "isTaskComplete": false,
            "actionsSummary": "tests still failing",
            "relevantFiles": ["src/present.ts", "src/missing.ts"],
            "newTaskDefinition": "fix the failing greeting test"
        }),
    );
    let engine = engine(dir.path(), oracle.clone(), ScriptedAsker::with_answers(&[]));

    let report = engine.run(task(dir.path()), 2).await.unwrap();

    assert_eq!(
        report.task.current_task_description.as_deref(),
        Some("fix the failing greeting test")
    );
    assert!(report.task.relevant_files.contains(&File::new("src/present.ts", "here")));
    assert!(report.task.relevant_files.contains(&File::new("src/missing.ts", "")));
    assert_eq!(
        report.summaries[0],
        "Iteration 1: nothing to do | Analysis: tests still failing"
    );

    let second = &oracle.prompts(Kind::Generation)[1];
    assert!(second.contains("Task Description: fix the failing greeting test"));
    assert!(second.contains("Task History:\nIteration 1: nothing to do"));
}
