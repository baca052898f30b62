use crate::workflow::Step;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Yes/no decision for one `(step, gate)` pair, checked on every
/// scheduling tick. A closed gate keeps the step pending; nothing is
/// cached, so a gate flipping open unblocks on the next tick.
pub trait GateEvaluator: Send {
    fn evaluate(&self, step: &Step, gate: &str) -> bool;
}

/// Every gate is open. The default when no gate state file is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOpenGate;

impl GateEvaluator for AlwaysOpenGate {
    fn evaluate(&self, _step: &Step, _gate: &str) -> bool {
        true
    }
}

/// Reads a `{gate_name: bool}` JSON map on every call. External systems
/// toggle the file; missing files, bad JSON and missing keys all evaluate
/// to closed.
#[derive(Debug, Clone)]
pub struct FileBackedGate {
    path: PathBuf,
}

impl FileBackedGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load_states(&self) -> BTreeMap<String, bool> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&raw) else {
            return BTreeMap::new();
        };
        let Some(entries) = payload.as_object() else {
            return BTreeMap::new();
        };
        entries
            .iter()
            .map(|(key, value)| (key.clone(), value.as_bool().unwrap_or(false)))
            .collect()
    }
}

impl GateEvaluator for FileBackedGate {
    fn evaluate(&self, _step: &Step, gate: &str) -> bool {
        self.load_states().get(gate).copied().unwrap_or(false)
    }
}

/// Logical AND over a fixed list of evaluators, short-circuiting on the
/// first closed gate.
pub struct CompositeGate {
    evaluators: Vec<Box<dyn GateEvaluator>>,
}

impl CompositeGate {
    pub fn new(evaluators: Vec<Box<dyn GateEvaluator>>) -> Self {
        let evaluators = if evaluators.is_empty() {
            vec![Box::new(AlwaysOpenGate) as Box<dyn GateEvaluator>]
        } else {
            evaluators
        };
        Self { evaluators }
    }
}

impl GateEvaluator for CompositeGate {
    fn evaluate(&self, step: &Step, gate: &str) -> bool {
        self.evaluators
            .iter()
            .all(|evaluator| evaluator.evaluate(step, gate))
    }
}
