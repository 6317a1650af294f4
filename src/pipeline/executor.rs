use super::context::PipelineContext;
use super::core::{PipelineReport, PipelineStage, StageResult};
use crate::error::CestResult;
use crate::app_log;
use crate::logger::LogLevel;
use std::time::Instant;

/// Pipeline executor that runs stages sequentially
///
/// # Example
/// ```no_run
/// use cestreg::pipeline::{Pipeline, PipelineContext};
/// use cestreg::pipeline::stages::CleanupStage;
///
/// let pipeline = Pipeline::builder("coregistration")
///     .add_stage(CleanupStage::new(false))
///     .build();
///
/// let mut context = PipelineContext::new("session-123");
/// let report = pipeline.execute(&mut context)?;
/// # Ok::<(), cestreg::error::CestError>(())
/// ```
pub struct Pipeline {
    name: String,
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    /// Create a new pipeline builder
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Get the pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Execute the pipeline
    ///
    /// Stages run in order; a stage is skipped when its `should_skip()`
    /// says so. The first failing stage stops the pipeline: its result is
    /// appended to the context's stage history and its error is returned
    /// as is. No stage is retried.
    pub fn execute(&self, context: &mut PipelineContext) -> CestResult<PipelineReport> {
        app_log!(
            LogLevel::Info,
            "pipeline",
            "Starting pipeline '{}' with {} stages (session: {})",
            self.name,
            self.stages.len(),
            context.session_id()
        );

        let pipeline_start = Instant::now();
        let mut stage_results = Vec::new();

        context.set_metadata("pipeline_name", &self.name);

        for (index, stage) in self.stages.iter().enumerate() {
            let stage_name = stage.name();

            if stage.should_skip(context) {
                app_log!(
                    LogLevel::Info,
                    "pipeline",
                    "Skipping stage {}/{}: {} (session: {})",
                    index + 1,
                    self.stages.len(),
                    stage_name,
                    context.session_id()
                );
                let result = StageResult::skipped(stage_name);
                context.record_stage(result.clone());
                stage_results.push(result);
                continue;
            }

            app_log!(
                LogLevel::Info,
                "pipeline",
                "Executing stage {}/{}: {} (session: {})",
                index + 1,
                self.stages.len(),
                stage_name,
                context.session_id()
            );

            let stage_start = Instant::now();
            let outcome = stage
                .pre_execute(context)
                .and_then(|_| stage.execute(context))
                .and_then(|_| stage.post_execute(context));
            let duration = stage_start.elapsed();

            match outcome {
                Ok(()) => {
                    app_log!(
                        LogLevel::Info,
                        "pipeline",
                        "Stage '{}' completed successfully in {:.2}s (session: {})",
                        stage_name,
                        duration.as_secs_f64(),
                        context.session_id()
                    );
                    let result = StageResult::success(stage_name, duration);
                    context.record_stage(result.clone());
                    stage_results.push(result);
                }
                Err(e) => {
                    app_log!(
                        LogLevel::Error,
                        "pipeline",
                        "Stage '{}' failed: {} (session: {})",
                        stage_name,
                        e,
                        context.session_id()
                    );
                    context.record_stage(StageResult::failure(stage_name, e.to_string(), duration));
                    return Err(e);
                }
            }
        }

        let total_duration = pipeline_start.elapsed();
        app_log!(
            LogLevel::Info,
            "pipeline",
            "Pipeline '{}' completed successfully in {:.2}s (session: {})",
            self.name,
            total_duration.as_secs_f64(),
            context.session_id()
        );

        Ok(PipelineReport::new(&self.name, stage_results, total_duration))
    }
}

/// Builder for constructing pipelines
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Box<dyn PipelineStage>>,
}

impl PipelineBuilder {
    /// Create a new pipeline builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Add a stage to the pipeline
    pub fn add_stage<S: PipelineStage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Add a boxed stage to the pipeline
    pub fn add_boxed_stage(mut self, stage: Box<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Build the pipeline
    pub fn build(self) -> Pipeline {
        Pipeline {
            name: self.name,
            stages: self.stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CestError;

    struct SuccessStage {
        name: String,
    }

    impl SuccessStage {
        fn new(name: impl Into<String>) -> Self {
            Self { name: name.into() }
        }
    }

    impl PipelineStage for SuccessStage {
        fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
            context.set_string(&self.name, "executed");
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct FailStage {
        name: String,
    }

    impl PipelineStage for FailStage {
        fn execute(&self, _context: &mut PipelineContext) -> CestResult<()> {
            Err(CestError::tool("3dQwarp", "** FATAL ERROR: empty dataset"))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct SkippableStage {
        name: String,
    }

    impl PipelineStage for SkippableStage {
        fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
            context.set_string(&self.name, "executed");
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn should_skip(&self, context: &PipelineContext) -> bool {
            context.get_bool("skip_optional").unwrap_or(false)
        }
    }

    struct GuardedStage;

    impl PipelineStage for GuardedStage {
        fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
            context.set_string("guarded", "executed");
            Ok(())
        }

        fn name(&self) -> &str {
            "guarded"
        }

        fn pre_execute(&self, context: &PipelineContext) -> CestResult<()> {
            context.get_path("anat").map(|_| ())
        }
    }

    #[test]
    fn test_pipeline_success() {
        let pipeline = Pipeline::builder("test-pipeline")
            .add_stage(SuccessStage::new("stage1"))
            .add_stage(SuccessStage::new("stage2"))
            .build();

        let mut context = PipelineContext::new("session-123");
        let report = pipeline.execute(&mut context).unwrap();

        assert_eq!(report.stage_results.len(), 2);
        assert_eq!(report.executed_stages(), 2);
        assert_eq!(pipeline.stage_names(), vec!["stage1", "stage2"]);
        assert!(context.has("stage1"));
        assert!(context.has("stage2"));
        assert_eq!(context.get_metadata("pipeline_name"), Some("test-pipeline"));
    }

    #[test]
    fn test_failure_propagates_original_error() {
        let pipeline = Pipeline::builder("test-pipeline")
            .add_stage(SuccessStage::new("stage1"))
            .add_stage(FailStage {
                name: "stage2".to_string(),
            })
            .add_stage(SuccessStage::new("stage3"))
            .build();

        let mut context = PipelineContext::new("session-123");
        let result = pipeline.execute(&mut context);

        match result {
            Err(CestError::ToolExecution { tool, .. }) => assert_eq!(tool, "3dQwarp"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(context.has("stage1"));
        assert!(!context.has("stage3"));

        let history = context.stage_history();
        assert_eq!(history.len(), 2);
        assert!(!history[1].success);
        assert_eq!(history[1].stage_name, "stage2");
    }

    #[test]
    fn test_pipeline_with_skipped_stage() {
        let pipeline = Pipeline::builder("test-pipeline")
            .add_stage(SuccessStage::new("stage1"))
            .add_stage(SkippableStage {
                name: "stage2".to_string(),
            })
            .add_stage(SuccessStage::new("stage3"))
            .build();

        let mut context = PipelineContext::new("session-123");
        context.set_bool("skip_optional", true);
        let report = pipeline.execute(&mut context).unwrap();

        assert_eq!(report.stage_results.len(), 3);
        assert_eq!(report.executed_stages(), 2);
        assert_eq!(report.skipped_stages(), 1);
        assert!(!context.has("stage2"));
        assert!(context.has("stage3"));
    }

    #[test]
    fn test_pre_execute_failure_stops_before_execute() {
        let pipeline = Pipeline::builder("test-pipeline")
            .add_stage(GuardedStage)
            .build();

        let mut context = PipelineContext::new("session-123");
        let result = pipeline.execute(&mut context);

        assert!(matches!(result, Err(CestError::PipelineError(_))));
        assert!(!context.has("guarded"));
    }
}
