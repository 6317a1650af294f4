use super::keys;
use crate::error::CestResult;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::registration::{RigidAligner, Toolbox};
use std::time::Duration;

/// Stage running the optional rigid pre-alignment of anat onto CEST
///
/// Only runs when `prior_rigid_registration` is configured; useful when the
/// headers carry missing or wrong position information.
///
/// # Context Outputs
/// - `rigid_aligned` (path) and `rigid_transform` (Transform as JSON), both
///   tracked as intermediates
pub struct RigidStage {
    toolbox: Toolbox,
}

impl RigidStage {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }
}

impl PipelineStage for RigidStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let output_dir = context.get_path(keys::OUTPUT_DIR)?;
        let anat = context.get_path(keys::ANAT_UNBIASED)?;
        let cest = context.get_path(keys::CEST_UNBIASED)?;
        let config = self.toolbox.config();

        let alignment = RigidAligner::new(&self.toolbox).in_dir(&output_dir).align(
            &anat,
            &cest,
            config.brain_volume,
            config.mask_strategy,
        )?;

        context.add_artifact(&alignment.aligned);
        context.add_artifact(alignment.transform.path());
        context.set_path(keys::RIGID_ALIGNED, alignment.aligned.clone());
        context.set_json(keys::RIGID_TRANSFORM, &alignment.transform)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Rigid Pre-alignment"
    }

    fn should_skip(&self, _context: &PipelineContext) -> bool {
        !self.toolbox.config().prior_rigid_registration
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(60))
    }
}
