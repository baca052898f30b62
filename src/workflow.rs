use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowLoadError {
    #[error("workflow file not found: {path}")]
    NotFound { path: String },
    #[error("failed to read workflow {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("workflow {path} is not valid YAML: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("workflow file must declare a 'steps' list")]
    MissingSteps,
    #[error("workflow step #{index} must be a mapping")]
    StepNotMapping { index: usize },
    #[error("workflow step #{index} is invalid: {reason}")]
    InvalidStep { index: usize, reason: String },
    #[error("workflow step #{index} is missing 'id'")]
    MissingId { index: usize },
    #[error("duplicate step id detected: {step_id}")]
    DuplicateStepId { step_id: String },
    #[error("step '{step_id}' must declare both 'prompt' and 'agent'")]
    MissingAgentOrPrompt { step_id: String },
    #[error("step '{step_id}' has unknown dependency '{dep}'")]
    UnknownDependency { step_id: String, dep: String },
    #[error("step '{step_id}' references unknown next step '{next}'")]
    UnknownNextStep { step_id: String, next: String },
    #[error("step '{step_id}' loops back to unknown step '{target}'")]
    UnknownLoopBackTarget { step_id: String, target: String },
    #[error("step '{step_id}' loop references unknown step '{target}'")]
    UnknownLoopItemsStep { step_id: String, target: String },
    #[error("step '{step_id}' loop source '{target}' is not in its needs list")]
    LoopSourceNotInNeeds { step_id: String, target: String },
    #[error(
        "step '{step_id}' loop must declare exactly one of items, items_from_step, items_from_artifact"
    )]
    LoopSourceCount { step_id: String },
    #[error("step '{step_id}' loop items must be a list")]
    LoopItemsNotAList { step_id: String },
}

/// Per-step iteration construct. Exactly one item source is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopConfig {
    pub items: Option<Vec<serde_json::Value>>,
    pub items_from_step: Option<String>,
    pub items_from_artifact: Option<String>,
    pub max_iterations: Option<u32>,
    /// Reserved; accepted at parse time and ignored by the scheduler.
    pub until_condition: Option<String>,
    pub item_var: String,
    pub index_var: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: String,
    pub agent: String,
    pub prompt: String,
    pub needs: Vec<String>,
    pub next_on_success: Vec<String>,
    pub gates: Vec<String>,
    pub loop_back_to: Option<String>,
    pub human_in_the_loop: bool,
    pub model: Option<String>,
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "loop")]
    pub loop_config: Option<LoopConfig>,
}

/// Immutable workflow definition: a mapping from step id to step. The
/// normalized document form still carries steps as a list, so the map is
/// flattened back to its values when serializing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Workflow {
    pub name: String,
    pub description: String,
    #[serde(serialize_with = "steps_as_document_list")]
    pub steps: BTreeMap<String, Step>,
}

fn steps_as_document_list<S>(
    steps: &BTreeMap<String, Step>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(steps.values())
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    pub fn entry_steps(&self) -> Vec<&str> {
        self.steps
            .values()
            .filter(|step| step.needs.is_empty())
            .map(|step| step.id.as_str())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    needs: Vec<String>,
    #[serde(default)]
    next_on_success: Vec<String>,
    #[serde(default)]
    gates: Vec<String>,
    #[serde(default)]
    loop_back_to: Option<String>,
    #[serde(default)]
    human_in_the_loop: bool,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default, rename = "loop")]
    loop_config: Option<RawLoop>,
}

#[derive(Debug, Deserialize)]
struct RawLoop {
    #[serde(default)]
    items: Option<serde_yaml::Value>,
    #[serde(default)]
    items_from_step: Option<String>,
    #[serde(default)]
    items_from_artifact: Option<String>,
    #[serde(default)]
    max_iterations: Option<u32>,
    #[serde(default)]
    until_condition: Option<String>,
    #[serde(default)]
    item_var: Option<String>,
    #[serde(default)]
    index_var: Option<String>,
}

/// Parse and structurally validate a workflow document. No side effects;
/// prompt paths are resolved later, at launch time.
pub fn load_workflow(path: &Path) -> Result<Workflow, WorkflowLoadError> {
    if !path.exists() {
        return Err(WorkflowLoadError::NotFound {
            path: path.display().to_string(),
        });
    }
    let raw = fs::read_to_string(path).map_err(|source| WorkflowLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let payload: RawWorkflow =
        serde_yaml::from_str(&raw).map_err(|source| WorkflowLoadError::Parse {
            path: path.display().to_string(),
            source,
        })?;

    let raw_steps = match payload.steps {
        Some(serde_yaml::Value::Sequence(entries)) => entries,
        _ => return Err(WorkflowLoadError::MissingSteps),
    };

    let mut steps: BTreeMap<String, Step> = BTreeMap::new();
    for (offset, entry) in raw_steps.into_iter().enumerate() {
        let index = offset + 1;
        if !matches!(entry, serde_yaml::Value::Mapping(_)) {
            return Err(WorkflowLoadError::StepNotMapping { index });
        }
        let raw_step: RawStep =
            serde_yaml::from_value(entry).map_err(|err| WorkflowLoadError::InvalidStep {
                index,
                reason: err.to_string(),
            })?;

        let step_id = match raw_step.id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(WorkflowLoadError::MissingId { index }),
        };
        if steps.contains_key(&step_id) {
            return Err(WorkflowLoadError::DuplicateStepId { step_id });
        }
        let (agent, prompt) = match (raw_step.agent, raw_step.prompt) {
            (Some(agent), Some(prompt)) if !agent.is_empty() && !prompt.is_empty() => {
                (agent, prompt)
            }
            _ => return Err(WorkflowLoadError::MissingAgentOrPrompt { step_id }),
        };

        let loop_config = match raw_step.loop_config {
            Some(raw_loop) => Some(parse_loop(&step_id, raw_loop)?),
            None => None,
        };

        steps.insert(
            step_id.clone(),
            Step {
                id: step_id,
                agent,
                prompt,
                needs: raw_step.needs,
                next_on_success: raw_step.next_on_success,
                gates: raw_step.gates,
                loop_back_to: raw_step.loop_back_to,
                human_in_the_loop: raw_step.human_in_the_loop,
                model: raw_step.model,
                metadata: raw_step.metadata,
                loop_config,
            },
        );
    }

    validate_edges(&steps)?;

    Ok(Workflow {
        name: payload.name.unwrap_or_else(|| "unnamed".to_string()),
        description: payload.description.unwrap_or_default(),
        steps,
    })
}

fn parse_loop(step_id: &str, raw: RawLoop) -> Result<LoopConfig, WorkflowLoadError> {
    let items = match raw.items {
        Some(serde_yaml::Value::Sequence(values)) => {
            let mut converted = Vec::with_capacity(values.len());
            for value in values {
                let json: serde_json::Value = serde_yaml::from_value(value).map_err(|_| {
                    WorkflowLoadError::LoopItemsNotAList {
                        step_id: step_id.to_string(),
                    }
                })?;
                converted.push(json);
            }
            Some(converted)
        }
        Some(serde_yaml::Value::Null) | None => None,
        Some(_) => {
            return Err(WorkflowLoadError::LoopItemsNotAList {
                step_id: step_id.to_string(),
            })
        }
    };

    let sources = [
        items.is_some(),
        raw.items_from_step.is_some(),
        raw.items_from_artifact.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if sources != 1 {
        return Err(WorkflowLoadError::LoopSourceCount {
            step_id: step_id.to_string(),
        });
    }

    Ok(LoopConfig {
        items,
        items_from_step: raw.items_from_step,
        items_from_artifact: raw.items_from_artifact,
        max_iterations: raw.max_iterations,
        until_condition: raw.until_condition,
        item_var: raw.item_var.unwrap_or_else(|| "item".to_string()),
        index_var: raw.index_var.unwrap_or_else(|| "index".to_string()),
    })
}

fn validate_edges(steps: &BTreeMap<String, Step>) -> Result<(), WorkflowLoadError> {
    let known: BTreeSet<&str> = steps.keys().map(String::as_str).collect();
    for step in steps.values() {
        for dep in &step.needs {
            if !known.contains(dep.as_str()) {
                return Err(WorkflowLoadError::UnknownDependency {
                    step_id: step.id.clone(),
                    dep: dep.clone(),
                });
            }
        }
        for next in &step.next_on_success {
            if !known.contains(next.as_str()) {
                return Err(WorkflowLoadError::UnknownNextStep {
                    step_id: step.id.clone(),
                    next: next.clone(),
                });
            }
        }
        if let Some(target) = &step.loop_back_to {
            if !known.contains(target.as_str()) {
                return Err(WorkflowLoadError::UnknownLoopBackTarget {
                    step_id: step.id.clone(),
                    target: target.clone(),
                });
            }
        }
        if let Some(loop_config) = &step.loop_config {
            if let Some(target) = &loop_config.items_from_step {
                if !known.contains(target.as_str()) {
                    return Err(WorkflowLoadError::UnknownLoopItemsStep {
                        step_id: step.id.clone(),
                        target: target.clone(),
                    });
                }
                if !step.needs.iter().any(|dep| dep == target) {
                    return Err(WorkflowLoadError::LoopSourceNotInNeeds {
                        step_id: step.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
