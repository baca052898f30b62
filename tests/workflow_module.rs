use agentflow::workflow::{load_workflow, Workflow, WorkflowLoadError};
use std::fs;
use std::path::PathBuf;

fn write_workflow(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("workflow.yaml");
    fs::write(&path, content).expect("write workflow");
    (dir, path)
}

fn load(content: &str) -> Result<Workflow, WorkflowLoadError> {
    let (_dir, path) = write_workflow(content);
    load_workflow(&path)
}

#[test]
fn full_step_surface_parses() {
    let workflow = load(
        "\
name: full
description: all the fields
steps:
  - id: plan
    agent: architect
    prompt: prompts/plan.md
    metadata:
      phase: design
    model: large-context
  - id: build
    agent: coder
    prompt: prompts/build.md
    needs: [plan]
    next_on_success: [review]
    human_in_the_loop: true
  - id: review
    agent: reviewer
    prompt: prompts/review.md
    needs: [build]
    gates: ['ci.tests: passed']
    loop_back_to: build
",
    )
    .expect("load");

    assert_eq!(workflow.name, "full");
    assert_eq!(workflow.steps.len(), 3);
    assert_eq!(workflow.entry_steps(), vec!["plan"]);

    let plan = workflow.step("plan").expect("plan");
    assert_eq!(plan.model.as_deref(), Some("large-context"));
    assert_eq!(plan.metadata["phase"], "design");

    let build = workflow.step("build").expect("build");
    assert!(build.human_in_the_loop);
    assert_eq!(build.next_on_success, vec!["review"]);

    let review = workflow.step("review").expect("review");
    assert_eq!(review.gates, vec!["ci.tests: passed"]);
    assert_eq!(review.loop_back_to.as_deref(), Some("build"));
}

#[test]
fn missing_steps_list_is_rejected() {
    let err = load("name: empty\n").expect_err("no steps");
    assert!(matches!(err, WorkflowLoadError::MissingSteps));
}

#[test]
fn missing_prompt_or_agent_is_rejected() {
    let err = load("steps:\n  - id: a\n    agent: coder\n").expect_err("no prompt");
    assert!(matches!(err, WorkflowLoadError::MissingAgentOrPrompt { .. }));
}

#[test]
fn unknown_dependency_is_rejected() {
    let err = load(
        "steps:\n  - id: a\n    agent: coder\n    prompt: p.md\n    needs: [ghost]\n",
    )
    .expect_err("unknown dep");
    assert!(err.to_string().contains("unknown dependency 'ghost'"));
}

#[test]
fn unknown_loop_back_target_is_rejected() {
    let err = load(
        "steps:\n  - id: a\n    agent: coder\n    prompt: p.md\n    loop_back_to: ghost\n",
    )
    .expect_err("unknown loop back");
    assert!(matches!(err, WorkflowLoadError::UnknownLoopBackTarget { .. }));
}

#[test]
fn static_loop_items_parse_with_custom_vars() {
    let workflow = load(
        "\
steps:
  - id: process
    agent: processor
    prompt: prompts/process.md
    loop:
      items: [item1, item2, item3]
      item_var: current_item
      index_var: idx
",
    )
    .expect("load");
    let loop_config = workflow
        .step("process")
        .and_then(|step| step.loop_config.as_ref())
        .expect("loop config");
    assert_eq!(
        loop_config.items.as_ref().expect("items").len(),
        3
    );
    assert_eq!(loop_config.item_var, "current_item");
    assert_eq!(loop_config.index_var, "idx");
}

#[test]
fn loop_vars_default_to_item_and_index() {
    let workflow = load(
        "steps:\n  - id: p\n    agent: a\n    prompt: p.md\n    loop:\n      items: [1]\n",
    )
    .expect("load");
    let loop_config = workflow
        .step("p")
        .and_then(|step| step.loop_config.as_ref())
        .expect("loop config");
    assert_eq!(loop_config.item_var, "item");
    assert_eq!(loop_config.index_var, "index");
    assert!(loop_config.max_iterations.is_none());
    assert!(loop_config.until_condition.is_none());
}

#[test]
fn loop_from_step_must_exist() {
    let err = load(
        "steps:\n  - id: p\n    agent: a\n    prompt: p.md\n    loop:\n      items_from_step: ghost\n",
    )
    .expect_err("unknown step");
    assert!(err.to_string().contains("unknown step"));
}

#[test]
fn loop_from_step_must_be_in_needs() {
    let err = load(
        "\
steps:
  - id: gen
    agent: generator
    prompt: prompts/gen.md
  - id: p
    agent: a
    prompt: p.md
    loop:
      items_from_step: gen
",
    )
    .expect_err("not in needs");
    assert!(err.to_string().contains("not in its needs list"));
}

#[test]
fn loop_with_multiple_sources_is_rejected() {
    let err = load(
        "\
steps:
  - id: p
    agent: a
    prompt: p.md
    loop:
      items: [one]
      items_from_artifact: artifacts/items.json
",
    )
    .expect_err("two sources");
    assert!(err.to_string().contains("exactly one of"));
}

#[test]
fn loop_items_must_be_a_list() {
    let err = load(
        "steps:\n  - id: p\n    agent: a\n    prompt: p.md\n    loop:\n      items: not a list\n",
    )
    .expect_err("scalar items");
    assert!(err.to_string().contains("must be a list"));
}

#[test]
fn until_condition_is_accepted_and_preserved() {
    let workflow = load(
        "\
steps:
  - id: p
    agent: a
    prompt: p.md
    loop:
      items: [1]
      until_condition: reserved-for-later
",
    )
    .expect("load");
    let loop_config = workflow
        .step("p")
        .and_then(|step| step.loop_config.as_ref())
        .expect("loop config");
    assert_eq!(loop_config.until_condition.as_deref(), Some("reserved-for-later"));
}

#[test]
fn normalized_serialization_reparses_to_the_same_workflow() {
    let workflow = load(
        "\
name: normal
description: round trip
steps:
  - id: a
    agent: coder
    prompt: prompts/a.md
    loop:
      items: [x, y]
  - id: b
    agent: reviewer
    prompt: prompts/b.md
    needs: [a]
    gates: [review]
",
    )
    .expect("load");

    let normalized = serde_yaml::to_string(&workflow).expect("serialize");
    let (_dir, path) = write_workflow(&normalized);
    let reparsed = load_workflow(&path).expect("reparse");
    assert_eq!(reparsed, workflow);

    let renormalized = serde_yaml::to_string(&reparsed).expect("reserialize");
    assert_eq!(renormalized, normalized);
}
