use super::keys;
use crate::error::CestResult;
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::registration::Toolbox;
use crate::transform::{Transform, TransformDirection, TransformKind};
use std::time::Duration;

/// Stage reducing the coregistration matrices to one anat to CEST transform
///
/// The rigid matrix (when present) comes first, then the warp matrix. The
/// product is written on a single line next to the coregistered anat as
/// `<coreg anat stem>_anat_to_cest.aff12.1D`.
///
/// # Context Outputs
/// - `coreg_transform` (Transform as JSON) from the raw anat to the raw CEST
pub struct ConcatTransformStage {
    toolbox: Toolbox,
}

impl ConcatTransformStage {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }
}

impl PipelineStage for ConcatTransformStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let coreg_anat = context.get_path(keys::COREG_ANAT)?;
        let warp_matrix = context.get_path(keys::WARP_MATRIX)?;
        let target = paths::derive(&coreg_anat, Some("_anat_to_cest"), Some(".aff12.1D"), None)?;

        let mut call = self.toolbox.call(&self.toolbox.tools().cat_matvec).flag("-ONELINE");
        if context.has(keys::RIGID_TRANSFORM) {
            let rigid: Transform = context.get_json(keys::RIGID_TRANSFORM)?;
            call = call.arg(rigid.path());
        }
        call = call
            .arg(&warp_matrix)
            .stdout_to(&target)
            .output("matrix", &target);
        self.toolbox.run(&call)?;

        let transform = Transform::new(
            &target,
            TransformKind::Affine,
            TransformDirection::Forward,
            context.get_path(keys::ANAT)?,
            context.get_path(keys::CEST)?,
        );
        app_log!(
            LogLevel::Info,
            "pipeline::concat",
            "Anat to CEST transform written to {} (session: {})",
            target.display(),
            context.session_id()
        );
        context.set_json(keys::COREG_TRANSFORM, &transform)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Concatenate Transforms"
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_millis(200))
    }
}
