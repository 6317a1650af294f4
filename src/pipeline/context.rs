use super::core::StageResult;
use crate::artifacts::IntermediateArtifactSet;
use crate::error::{CestError, CestResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// Pipeline context that holds data passed between stages
///
/// Keys name logical roles ("anat", "coreg_transform", ...). Paths and
/// plain values are stored as JSON; structured results such as transforms
/// go through `set_json`/`get_json`.
///
/// # Example
/// ```
/// use cestreg::pipeline::PipelineContext;
/// use std::path::PathBuf;
///
/// let mut context = PipelineContext::new("session-123");
/// context.set_path("anat", PathBuf::from("/data/anat.nii"));
/// context.set_bool("caching", false);
///
/// let anat = context.get_path("anat").unwrap();
/// assert!(!context.get_bool("caching").unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Session ID for this pipeline execution
    session_id: String,

    /// Key-value store for pipeline data
    data: HashMap<String, Value>,

    /// Intermediate files removed by the cleanup stage
    artifacts: IntermediateArtifactSet,

    /// Metadata about the pipeline execution
    metadata: HashMap<String, String>,

    /// Every stage result recorded so far, failures included
    stage_history: Vec<StageResult>,
}

impl PipelineContext {
    /// Create a new pipeline context
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            data: HashMap::new(),
            artifacts: IntermediateArtifactSet::new(),
            metadata: HashMap::new(),
            stage_history: Vec::new(),
        }
    }

    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Set a value in the context
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Get a value from the context
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value from the context or return an error if not found
    pub fn get_required(&self, key: &str) -> CestResult<&Value> {
        self.data.get(key).ok_or_else(|| {
            CestError::PipelineError(format!("Required context key not found: {}", key))
        })
    }

    /// Set a string value
    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), Value::String(value.into()));
    }

    /// Get a string value
    pub fn get_string(&self, key: &str) -> CestResult<String> {
        match self.get_required(key)? {
            Value::String(s) => Ok(s.clone()),
            _ => Err(CestError::PipelineError(format!(
                "Context key '{}' is not a string",
                key
            ))),
        }
    }

    /// Set a path value
    pub fn set_path(&mut self, key: impl Into<String>, path: impl Into<PathBuf>) {
        let path = path.into();
        self.data.insert(
            key.into(),
            Value::String(path.to_string_lossy().to_string()),
        );
    }

    /// Get a path value
    pub fn get_path(&self, key: &str) -> CestResult<PathBuf> {
        let path_str = self.get_string(key)?;
        Ok(PathBuf::from(path_str))
    }

    /// Get a path value if present
    pub fn get_optional_path(&self, key: &str) -> CestResult<Option<PathBuf>> {
        if self.has(key) {
            self.get_path(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Set a boolean value
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.data.insert(key.into(), Value::Bool(value));
    }

    /// Get a boolean value
    pub fn get_bool(&self, key: &str) -> CestResult<bool> {
        match self.get_required(key)? {
            Value::Bool(b) => Ok(*b),
            _ => Err(CestError::PipelineError(format!(
                "Context key '{}' is not a boolean",
                key
            ))),
        }
    }

    /// Set a number value
    ///
    /// Non-finite values cannot be represented and are rejected.
    pub fn set_number(&mut self, key: impl Into<String>, value: f64) -> CestResult<()> {
        let key = key.into();
        let number = serde_json::Number::from_f64(value).ok_or_else(|| {
            CestError::PipelineError(format!("Context key '{}' is not a finite number", key))
        })?;
        self.data.insert(key, Value::Number(number));
        Ok(())
    }

    /// Get a number value
    pub fn get_number(&self, key: &str) -> CestResult<f64> {
        match self.get_required(key)? {
            Value::Number(n) => n.as_f64().ok_or_else(|| {
                CestError::PipelineError(format!("Context key '{}' is not a valid number", key))
            }),
            _ => Err(CestError::PipelineError(format!(
                "Context key '{}' is not a number",
                key
            ))),
        }
    }

    /// Store any serializable value
    pub fn set_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> CestResult<()> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| {
            CestError::PipelineError(format!("Failed to serialize context key '{}': {}", key, e))
        })?;
        self.data.insert(key, value);
        Ok(())
    }

    /// Read back a value stored with `set_json`
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> CestResult<T> {
        let value = self.get_required(key)?.clone();
        serde_json::from_value(value).map_err(|e| {
            CestError::PipelineError(format!("Context key '{}' has the wrong shape: {}", key, e))
        })
    }

    /// Check if a key exists in the context
    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Remove a value from the context
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Record an intermediate file for the cleanup stage
    pub fn add_artifact(&mut self, path: impl Into<PathBuf>) {
        self.artifacts.push(path);
    }

    /// Record every file of a component's intermediate set
    pub fn add_artifacts(&mut self, artifacts: IntermediateArtifactSet) {
        self.artifacts.extend(artifacts);
    }

    pub fn artifacts(&self) -> &IntermediateArtifactSet {
        &self.artifacts
    }

    /// Hand the tracked intermediates over, leaving the context's set empty
    pub fn take_artifacts(&mut self) -> IntermediateArtifactSet {
        std::mem::take(&mut self.artifacts)
    }

    /// Set metadata
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// Get all metadata
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub(crate) fn record_stage(&mut self, result: StageResult) {
        self.stage_history.push(result);
    }

    /// Stage results recorded by every pipeline run on this context
    pub fn stage_history(&self) -> &[StageResult] {
        &self.stage_history
    }

    /// Get all data keys
    pub fn keys(&self) -> Vec<&String> {
        self.data.keys().collect()
    }
}
