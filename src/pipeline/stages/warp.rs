use super::keys;
use crate::error::CestResult;
use crate::app_log;
use crate::logger::LogLevel;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::registration::{NonlinearWarper, Toolbox};
use std::time::Duration;

/// Stage warping anat onto the CEST grid
///
/// Uses the rigidly aligned anat when the rigid stage ran, the bias
/// corrected one otherwise.
///
/// # Context Outputs
/// - `coreg_anat` (path) - Warped anat with the CEST obliquity
/// - `warp_matrix` (path, tracked as intermediate)
pub struct WarpStage {
    toolbox: Toolbox,
}

impl WarpStage {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }
}

impl PipelineStage for WarpStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let output_dir = context.get_path(keys::OUTPUT_DIR)?;
        let source = match context.get_optional_path(keys::RIGID_ALIGNED)? {
            Some(aligned) => aligned,
            None => context.get_path(keys::ANAT_UNBIASED)?,
        };
        let reference = context.get_path(keys::CEST_UNBIASED)?;

        let result = NonlinearWarper::new(&self.toolbox)
            .in_dir(&output_dir)
            .warp(&source, &reference)?;

        app_log!(
            LogLevel::Info,
            "pipeline::warp",
            "Anat warped to {} (session: {})",
            result.warped.display(),
            context.session_id()
        );

        context.add_artifacts(result.intermediates);
        context.add_artifact(&result.matrix);
        context.set_path(keys::WARP_MATRIX, result.matrix);
        context.set_path(keys::COREG_ANAT, result.warped);
        Ok(())
    }

    fn name(&self) -> &str {
        "Nonlinear Warp"
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }
}
