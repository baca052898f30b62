mod support;

use agentflow::orchestrator::RunOutcome;
use agentflow::state::StepStatus;
use std::sync::{Arc, Mutex};
use support::*;

const LOOPBACK_WORKFLOW: &str = "\
name: loopback
description: reviewer can send the coder back
steps:
  - id: step_a
    agent: coder
    prompt: prompts/code.md
  - id: step_b
    agent: reviewer
    prompt: prompts/review.md
    needs: [step_a]
    loop_back_to: step_a
";

fn gate_failing_runner(failures_before_pass: u32) -> ScriptedRunner {
    let gate_count = Arc::new(Mutex::new(0u32));
    ScriptedRunner::new(move |request| {
        if request.step.id == "step_b" {
            let mut count = gate_count.lock().expect("gate count");
            *count += 1;
            if *count <= failures_before_pass {
                return LaunchPlan::Report(gate_failure_report("step_b", "reviewer"));
            }
        }
        LaunchPlan::Report(completed_report(&request.step.id, &request.step.agent))
    })
}

#[test]
fn gate_failure_triggers_loop_back_then_completes() {
    let (_temp, repo) = setup_repo(&["code.md", "review.md"]);
    let (workflow, root) = load_test_workflow(&repo, LOOPBACK_WORKFLOW);

    let runner = gate_failing_runner(1);
    let launches = runner.launch_log();
    let mut options = fast_options();
    options.max_iterations = 3;
    let mut orchestrator = build_orchestrator(&repo, workflow, &root, runner, options);
    let outcome = orchestrator.run().expect("run");

    assert_eq!(outcome, RunOutcome::Completed);
    let order: Vec<String> = launches
        .lock()
        .expect("launches")
        .iter()
        .map(|l| l.step_id.clone())
        .collect();
    assert_eq!(order, vec!["step_a", "step_b", "step_a", "step_b"]);

    let state = orchestrator.state();
    assert_eq!(state.steps["step_a"].status, StepStatus::Completed);
    assert_eq!(state.steps["step_b"].status, StepStatus::Completed);
    assert_eq!(state.steps["step_b"].iteration_count, 1);
    assert_eq!(state.steps["step_a"].iteration_count, 0);
}

#[test]
fn max_iterations_turns_gate_failure_terminal() {
    let (_temp, repo) = setup_repo(&["code.md", "review.md"]);
    let (workflow, root) = load_test_workflow(&repo, LOOPBACK_WORKFLOW);

    let runner = gate_failing_runner(u32::MAX);
    let launches = runner.launch_log();
    let mut options = fast_options();
    options.max_attempts = 2;
    options.max_iterations = 2;
    let mut orchestrator = build_orchestrator(&repo, workflow, &root, runner, options);
    let outcome = orchestrator.run().expect("run");

    assert_eq!(
        outcome,
        RunOutcome::Failed {
            failed_steps: vec!["step_b".to_string()]
        }
    );

    let order: Vec<String> = launches
        .lock()
        .expect("launches")
        .iter()
        .map(|l| l.step_id.clone())
        .collect();
    // Two loop-backs are allowed; the third gate failure is terminal.
    assert_eq!(
        order,
        vec!["step_a", "step_b", "step_a", "step_b", "step_a", "step_b"]
    );

    let runtime = &orchestrator.state().steps["step_b"];
    assert_eq!(runtime.status, StepStatus::Failed);
    assert_eq!(runtime.iteration_count, 2);
    assert!(runtime
        .last_error
        .as_deref()
        .expect("last error")
        .to_lowercase()
        .contains("max iterations"));
}

#[test]
fn each_loop_iteration_gets_a_fresh_attempts_budget() {
    let (_temp, repo) = setup_repo(&["code.md", "review.md"]);
    let (workflow, root) = load_test_workflow(&repo, LOOPBACK_WORKFLOW);

    let target_failures = 3;
    let runner = gate_failing_runner(u32::MAX);
    let launches = runner.launch_log();
    let mut options = fast_options();
    options.max_attempts = 1;
    options.max_iterations = target_failures;
    let mut orchestrator = build_orchestrator(&repo, workflow, &root, runner, options);
    let outcome = orchestrator.run().expect("run");

    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    let step_b_attempts: Vec<u32> = launches
        .lock()
        .expect("launches")
        .iter()
        .filter(|l| l.step_id == "step_b")
        .map(|l| l.attempt)
        .collect();
    assert_eq!(step_b_attempts.len() as u32, target_failures + 1);
    assert!(step_b_attempts.iter().all(|attempt| *attempt == 1));
}

#[test]
fn loop_back_target_outside_needs_blocks_the_source() {
    let (_temp, repo) = setup_repo(&["prep.md", "fix.md", "gate.md"]);
    let (workflow, root) = load_test_workflow(
        &repo,
        "\
name: loopback_blocker
steps:
  - id: prep
    agent: prepper
    prompt: prompts/prep.md
  - id: fix
    agent: coder
    prompt: prompts/fix.md
    needs: [prep]
  - id: gate
    agent: reviewer
    prompt: prompts/gate.md
    needs: [prep]
    loop_back_to: fix
",
    );

    let gate_count = Arc::new(Mutex::new(0u32));
    let runner = ScriptedRunner::new(move |request| {
        if request.step.id == "gate" {
            let mut count = gate_count.lock().expect("count");
            *count += 1;
            if *count == 1 {
                return LaunchPlan::Report(gate_failure_report("gate", "reviewer"));
            }
        }
        LaunchPlan::Report(completed_report(&request.step.id, &request.step.agent))
    });
    let launches = runner.launch_log();

    let mut options = fast_options();
    options.max_iterations = 3;
    let mut orchestrator = build_orchestrator(&repo, workflow, &root, runner, options);
    let outcome = orchestrator.run().expect("run");

    assert_eq!(outcome, RunOutcome::Completed);
    let order: Vec<String> = launches
        .lock()
        .expect("launches")
        .iter()
        .map(|l| l.step_id.clone())
        .collect();

    let gate_positions: Vec<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, id)| id.as_str() == "gate")
        .map(|(idx, _)| idx)
        .collect();
    let fix_positions: Vec<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, id)| id.as_str() == "fix")
        .map(|(idx, _)| idx)
        .collect();

    assert!(gate_positions.len() >= 2, "gate should run twice: {order:?}");
    assert!(fix_positions.len() >= 2, "fix should rerun: {order:?}");
    assert!(
        fix_positions[1] < gate_positions[1],
        "loop-back must rerun fix before gate: {order:?}"
    );
    assert!(orchestrator.state().steps["gate"].blocked_by_loop.is_none());
}

#[test]
fn completed_gate_without_failure_never_loops() {
    let (_temp, repo) = setup_repo(&["code.md", "review.md"]);
    let (workflow, root) = load_test_workflow(&repo, LOOPBACK_WORKFLOW);

    let runner = gate_failing_runner(0);
    let launches = runner.launch_log();
    let mut orchestrator = build_orchestrator(&repo, workflow, &root, runner, fast_options());
    let outcome = orchestrator.run().expect("run");

    assert_eq!(outcome, RunOutcome::Completed);
    let order: Vec<String> = launches
        .lock()
        .expect("launches")
        .iter()
        .map(|l| l.step_id.clone())
        .collect();
    assert_eq!(order, vec!["step_a", "step_b"]);
    assert_eq!(orchestrator.state().steps["step_b"].iteration_count, 0);
}
