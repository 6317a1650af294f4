use crate::error::CestResult;
use crate::app_log;
use crate::logger::LogLevel;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::transform::Transform;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Stage that deletes the intermediates tracked in the pipeline context
///
/// Typically the last stage in a pipeline. Files named by the `keep` keys
/// survive even when tracked; a key may hold a path or a serialized
/// `Transform`, whose file is kept.
///
/// # Context Requirements
/// - Uses the artifact set from context
///
/// # Context Outputs
/// - Empties the artifact set after cleanup
pub struct CleanupStage {
    caching: bool,
    keep: Vec<&'static str>,
}

impl CleanupStage {
    /// Create a cleanup stage; with `caching` it never runs
    pub fn new(caching: bool) -> Self {
        Self {
            caching,
            keep: Vec::new(),
        }
    }

    /// Protect the file stored under `key`
    pub fn keep(mut self, key: &'static str) -> Self {
        self.keep.push(key);
        self
    }

    fn kept_paths(&self, context: &PipelineContext) -> CestResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for key in &self.keep {
            match context.get(key) {
                None => {}
                Some(Value::String(_)) => paths.push(context.get_path(key)?),
                Some(_) => {
                    let transform: Transform = context.get_json(key)?;
                    paths.push(transform.path().to_path_buf());
                }
            }
        }
        Ok(paths)
    }
}

impl PipelineStage for CleanupStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let kept = self.kept_paths(context)?;
        let mut artifacts = context.take_artifacts();

        if artifacts.is_empty() {
            app_log!(
                LogLevel::Info,
                "pipeline::cleanup",
                "No intermediates to clean up (session: {})",
                context.session_id()
            );
            return Ok(());
        }

        app_log!(
            LogLevel::Info,
            "pipeline::cleanup",
            "Cleaning up {} intermediate file(s) (session: {})",
            artifacts.len(),
            context.session_id()
        );

        let keep: Vec<&std::path::Path> = kept.iter().map(PathBuf::as_path).collect();
        let summary = artifacts.cleanup(false, &keep, "pipeline::cleanup");

        app_log!(
            LogLevel::Info,
            "pipeline::cleanup",
            "Cleanup complete: {} deleted, {} already gone, {} kept, {} failed (session: {})",
            summary.deleted,
            summary.missing,
            summary.kept,
            summary.failed,
            context.session_id()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "Cleanup Intermediates"
    }

    fn should_skip(&self, _context: &PipelineContext) -> bool {
        self.caching
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_millis(100))
    }
}
