use super::keys;
use crate::config::WarpMode;
use crate::error::CestResult;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::registration::{SliceWarper, Toolbox};
use std::time::Duration;

/// Stage refining the warped anat slice by slice
///
/// Runs only in `WarpMode::PerSlice`. The whole-volume result it starts from
/// becomes an intermediate.
///
/// # Context Outputs
/// - `coreg_anat` (path) - Replaced by the stacked per-slice result
/// - `slice_transforms` (JSON list, `null` for skipped slices)
pub struct SliceWarpStage {
    toolbox: Toolbox,
}

impl SliceWarpStage {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }
}

impl PipelineStage for SliceWarpStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let output_dir = context.get_path(keys::OUTPUT_DIR)?;
        let warped = context.get_path(keys::COREG_ANAT)?;
        let reference = context.get_path(keys::CEST_UNBIASED)?;
        let (tx, ty) = self.toolbox.config().slice_voxel_size;

        let result = SliceWarper::new(&self.toolbox)
            .in_dir(&output_dir)
            .warp_per_slice(&warped, &reference, (tx, ty), None)?;

        context.add_artifact(&warped);
        context.set_json(keys::SLICE_TRANSFORMS, &result.transforms)?;
        context.set_path(keys::COREG_ANAT, result.merged);
        Ok(())
    }

    fn name(&self) -> &str {
        "Per-slice Warp"
    }

    fn should_skip(&self, _context: &PipelineContext) -> bool {
        self.toolbox.config().warp_mode != WarpMode::PerSlice
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(120))
    }
}
