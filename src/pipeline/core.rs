use crate::error::CestResult;
use std::time::Duration;

use super::context::PipelineContext;

/// A single step of a registration pipeline
///
/// Stages read their inputs from the shared `PipelineContext` and write the
/// artifacts they produce back into it. They are executed sequentially by
/// the pipeline executor.
///
/// # Example
/// ```
/// use cestreg::error::CestResult;
/// use cestreg::pipeline::{PipelineContext, PipelineStage};
///
/// struct Announce;
///
/// impl PipelineStage for Announce {
///     fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
///         let anat = context.get_path("anat")?;
///         context.set_string("announced", anat.display().to_string());
///         Ok(())
///     }
///
///     fn name(&self) -> &str {
///         "Announce"
///     }
/// }
/// ```
pub trait PipelineStage: Send + Sync {
    /// Execute this stage
    ///
    /// An error stops the pipeline and is returned to the caller unchanged.
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()>;

    /// Stage name for logging and reports
    fn name(&self) -> &str;

    /// Rough duration, `None` when unknown
    fn estimated_duration(&self) -> Option<Duration> {
        None
    }

    /// Check if this stage should be skipped based on context
    ///
    /// Used for optional stages such as the rigid pre-alignment
    fn should_skip(&self, _context: &PipelineContext) -> bool {
        false
    }

    /// Called before execute() to check the stage's inputs
    fn pre_execute(&self, _context: &PipelineContext) -> CestResult<()> {
        Ok(())
    }

    /// Called after a successful execute()
    fn post_execute(&self, _context: &PipelineContext) -> CestResult<()> {
        Ok(())
    }
}

/// Result of a pipeline stage execution
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    /// Stage name
    pub stage_name: String,

    /// Whether the stage succeeded
    pub success: bool,

    /// Error message if failed
    pub error: Option<String>,

    /// Duration of execution
    pub duration: Duration,

    /// Whether the stage was skipped
    pub skipped: bool,
}

impl StageResult {
    /// Create a successful stage result
    pub fn success(stage_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            stage_name: stage_name.into(),
            success: true,
            error: None,
            duration,
            skipped: false,
        }
    }

    /// Create a failed stage result
    pub fn failure(
        stage_name: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            success: false,
            error: Some(error.into()),
            duration,
            skipped: false,
        }
    }

    /// Create a skipped stage result
    pub fn skipped(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            success: true,
            error: None,
            duration: Duration::from_secs(0),
            skipped: true,
        }
    }
}

/// Summary of a pipeline run that went through every stage
///
/// Failed runs return the stage's error instead; their partial history is
/// kept in `PipelineContext::stage_history`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Pipeline name
    pub pipeline_name: String,

    /// Results from each stage, in execution order
    pub stage_results: Vec<StageResult>,

    /// Total duration
    pub total_duration: Duration,
}

impl PipelineReport {
    pub fn new(
        pipeline_name: impl Into<String>,
        stage_results: Vec<StageResult>,
        total_duration: Duration,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            stage_results,
            total_duration,
        }
    }

    /// Get the number of stages that were executed (not skipped)
    pub fn executed_stages(&self) -> usize {
        self.stage_results.iter().filter(|r| !r.skipped).count()
    }

    /// Get the number of stages that were skipped
    pub fn skipped_stages(&self) -> usize {
        self.stage_results.iter().filter(|r| r.skipped).count()
    }

    /// Look up a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage_name == name)
    }
}
