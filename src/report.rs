use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Required keys every run report must carry, schema or no schema.
const REQUIRED_FIELDS: [&str; 7] = [
    "schema",
    "run_id",
    "step_id",
    "agent",
    "status",
    "started_at",
    "ended_at",
];

/// Instruction phrases agents sometimes leave behind instead of real
/// artifact paths. Matching entries mean the template was never filled in.
const PLACEHOLDER_ARTIFACT_PHRASES: [&str; 6] = [
    "list of created file paths",
    "replace with actual artifact",
    "relative path to each created file",
    "relative path to the artifact you produced",
    "replace with relative path for each artifact",
    "replace with the relative path to each artifact",
];

const PLACEHOLDER_LOG_PHRASES: [&str; 6] = [
    "summary of what you accomplished",
    "replace with actual log entry",
    "concise summary of work performed",
    "concise bullet summarizing work",
    "replace with a concise summary",
    "replace with a short summary of what you accomplished",
];

const PLACEHOLDER_ENDED_AT_PHRASES: [&str; 2] = [
    "replace with utc timestamp when you finish",
    "insert completion timestamp",
];

#[derive(Debug, thiserror::Error)]
pub enum RunReportError {
    #[error("run report not found: {path}")]
    NotFound { path: String },
    #[error("failed to read run report {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("run report {path} contains invalid JSON after {attempts} attempts: {source}")]
    InvalidJson {
        path: String,
        attempts: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error("run report {path} must be a JSON object")]
    NotAnObject { path: String },
    #[error("run report {path} missing fields: {fields}")]
    MissingFields { path: String, fields: String },
    #[error("run report {path} failed schema validation: {reason}")]
    SchemaValidation { path: String, reason: String },
    #[error("run report {path} still contains template content: {reason}")]
    Placeholder { path: String, reason: String },
    #[error("failed to load run report schema {path}: {reason}")]
    SchemaLoad { path: String, reason: String },
}

/// The artifact an agent drops at the agreed path when it finishes.
/// `raw` preserves the full payload for forward compatibility.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub schema: String,
    pub run_id: String,
    pub step_id: String,
    pub agent: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: String,
    pub artifacts: Vec<String>,
    pub metrics: Map<String, Value>,
    pub logs: Vec<String>,
    pub next_suggested_steps: Vec<Value>,
    pub gate_failure: bool,
    pub raw: Map<String, Value>,
}

/// Reads and validates run reports. The file is written by an independent
/// process, so parse failures are retried with a short delay before they
/// count as errors.
#[derive(Debug, Clone)]
pub struct RunReportReader {
    schema_required: Option<Vec<String>>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl Default for RunReportReader {
    fn default() -> Self {
        Self {
            schema_required: None,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

impl RunReportReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate payloads against the `required` key list of a JSON schema
    /// document. Only the structural subset is honored.
    pub fn with_schema(mut self, schema_path: &Path) -> Result<Self, RunReportError> {
        let raw = fs::read_to_string(schema_path).map_err(|err| RunReportError::SchemaLoad {
            path: schema_path.display().to_string(),
            reason: err.to_string(),
        })?;
        let schema: Value =
            serde_json::from_str(&raw).map_err(|err| RunReportError::SchemaLoad {
                path: schema_path.display().to_string(),
                reason: err.to_string(),
            })?;
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        self.schema_required = Some(required);
        Ok(self)
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn read(&self, path: &Path) -> Result<RunReport, RunReportError> {
        if !path.exists() {
            return Err(RunReportError::NotFound {
                path: path.display().to_string(),
            });
        }

        let payload = self.read_json_with_retry(path)?;
        let Value::Object(payload) = payload else {
            return Err(RunReportError::NotAnObject {
                path: path.display().to_string(),
            });
        };

        if let Some(required) = &self.schema_required {
            let missing: Vec<&str> = required
                .iter()
                .map(String::as_str)
                .filter(|key| !payload.contains_key(*key))
                .collect();
            if !missing.is_empty() {
                return Err(RunReportError::SchemaValidation {
                    path: path.display().to_string(),
                    reason: format!("missing required keys: {}", missing.join(", ")),
                });
            }
        }

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| !payload.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(RunReportError::MissingFields {
                path: path.display().to_string(),
                fields: missing.join(", "),
            });
        }

        let artifacts = normalize_string_list(payload.get("artifacts"));
        let logs = normalize_string_list(payload.get("logs"));
        let ended_at = string_field(&payload, "ended_at").trim().to_string();
        self.reject_placeholders(path, &artifacts, &logs, &ended_at)?;

        Ok(RunReport {
            schema: string_field(&payload, "schema"),
            run_id: string_field(&payload, "run_id"),
            step_id: string_field(&payload, "step_id"),
            agent: string_field(&payload, "agent"),
            status: string_field(&payload, "status").to_uppercase(),
            started_at: string_field(&payload, "started_at"),
            ended_at,
            artifacts,
            metrics: payload
                .get("metrics")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            logs,
            next_suggested_steps: payload
                .get("next_suggested_steps")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            gate_failure: payload
                .get("gate_failure")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            raw: payload,
        })
    }

    fn read_json_with_retry(&self, path: &Path) -> Result<Value, RunReportError> {
        let mut last_error = None;
        for attempt in 1..=self.retry_attempts {
            let raw = fs::read_to_string(path).map_err(|source| RunReportError::Read {
                path: path.display().to_string(),
                source,
            })?;
            match serde_json::from_str(&raw) {
                Ok(value) => return Ok(value),
                Err(source) => {
                    last_error = Some(source);
                    if attempt < self.retry_attempts && !self.retry_delay.is_zero() {
                        thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        Err(RunReportError::InvalidJson {
            path: path.display().to_string(),
            attempts: self.retry_attempts,
            source: last_error.expect("retry loop ran at least once"),
        })
    }

    fn reject_placeholders(
        &self,
        path: &Path,
        artifacts: &[String],
        logs: &[String],
        ended_at: &str,
    ) -> Result<(), RunReportError> {
        let placeholder = |reason: &str| RunReportError::Placeholder {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        if matches_placeholder(artifacts, &PLACEHOLDER_ARTIFACT_PHRASES) {
            return Err(placeholder(
                "placeholder artifact entries detected; replace them with real relative paths",
            ));
        }
        if matches_placeholder(logs, &PLACEHOLDER_LOG_PHRASES) {
            return Err(placeholder(
                "placeholder logs detected; describe what was actually accomplished",
            ));
        }
        if logs.is_empty() {
            return Err(placeholder(
                "at least one log entry is required in the run report",
            ));
        }
        if ended_at.is_empty() {
            return Err(placeholder(
                "missing ended_at timestamp; provide the completion time",
            ));
        }
        let ended_lower = ended_at.to_lowercase();
        if matches_placeholder(
            std::slice::from_ref(&ended_lower),
            &PLACEHOLDER_ENDED_AT_PHRASES,
        ) {
            return Err(placeholder(
                "placeholder ended_at timestamp detected; record the real completion time",
            ));
        }
        Ok(())
    }
}

fn string_field(payload: &Map<String, Value>, key: &str) -> String {
    match payload.get(key) {
        Some(Value::String(value)) => value.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn normalize_string_list(value: Option<&Value>) -> Vec<String> {
    let entries: Vec<&Value> = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(values)) => values.iter().collect(),
        Some(other) => vec![other],
    };
    entries
        .into_iter()
        .map(|entry| match entry {
            Value::String(text) => text.trim().to_string(),
            other => other.to_string(),
        })
        .filter(|text| !text.is_empty())
        .collect()
}

fn matches_placeholder(values: &[String], phrases: &[&str]) -> bool {
    if values.is_empty() {
        return false;
    }
    let normalized: Vec<String> = values
        .iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .collect();
    let joined = normalized.join(" ");
    phrases.iter().any(|phrase| {
        normalized.iter().any(|value| value == phrase) || joined.contains(phrase)
    })
}
