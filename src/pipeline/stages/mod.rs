//! Registration pipeline stages
//!
//! Coregistration (anat onto CEST):
//! 1. CopyInputsStage - Copy raw volumes into the output directory
//! 2. BiasCorrectStage - Intensity bias correction of both copies
//! 3. RigidStage - Optional shift/rotate pre-alignment
//! 4. WarpStage - Whole-volume nonlinear warp
//! 5. SliceWarpStage - Optional per-slice refinement
//! 6. ConcatTransformStage - One-line anat to CEST matrix
//! 7. CleanupStage - Remove intermediates unless caching
//!
//! Template registration:
//! 1. AnatToTemplateStage - Anat onto the template
//! 2. CestToTemplateStage - CEST through the full transform chain
//! 3. CleanupStage

pub mod bias;
pub mod cleanup;
pub mod concat;
pub mod inputs;
pub mod rigid;
pub mod slice_warp;
pub mod template;
pub mod warp;

// Re-export stages
pub use bias::BiasCorrectStage;
pub use cleanup::CleanupStage;
pub use concat::ConcatTransformStage;
pub use inputs::CopyInputsStage;
pub use rigid::RigidStage;
pub use slice_warp::SliceWarpStage;
pub use template::{AnatToTemplateStage, CestToTemplateStage};
pub use warp::WarpStage;

use super::Pipeline;
use crate::registration::{TemplateRegistrar, Toolbox};
use std::sync::Arc;

/// Context keys shared by the stages
pub mod keys {
    /// Raw anatomical volume (input)
    pub const ANAT: &str = "anat";
    /// Raw CEST volume (input)
    pub const CEST: &str = "cest";
    /// Directory receiving every artifact (input)
    pub const OUTPUT_DIR: &str = "output_dir";
    /// Template head volume (input of template registration)
    pub const TEMPLATE: &str = "template";
    /// `TemplateOptions` as JSON (optional input of template registration)
    pub const TEMPLATE_OPTIONS: &str = "template_options";

    pub const ANAT_COPY: &str = "anat_copy";
    pub const CEST_COPY: &str = "cest_copy";
    pub const ANAT_UNBIASED: &str = "anat_unbiased";
    pub const CEST_UNBIASED: &str = "cest_unbiased";
    pub const RIGID_ALIGNED: &str = "rigid_aligned";
    pub const RIGID_TRANSFORM: &str = "rigid_transform";
    pub const WARP_MATRIX: &str = "warp_matrix";
    pub const SLICE_TRANSFORMS: &str = "slice_transforms";
    pub const COREG_ANAT: &str = "coreg_anat";
    pub const COREG_TRANSFORM: &str = "coreg_transform";

    pub const REGISTERED_ANAT: &str = "registered_anat";
    pub const PRE_TRANSFORM: &str = "pre_transform";
    pub const TEMPLATE_TRANSFORM: &str = "template_transform";
    pub const REGISTERED_CEST: &str = "registered_cest";
}

/// Stages bringing anat onto the CEST volume
pub fn coregistration_pipeline(toolbox: &Toolbox) -> Pipeline {
    Pipeline::builder("coregistration")
        .add_stage(CopyInputsStage::new(toolbox.clone()))
        .add_stage(BiasCorrectStage::new(toolbox.clone()))
        .add_stage(RigidStage::new(toolbox.clone()))
        .add_stage(WarpStage::new(toolbox.clone()))
        .add_stage(SliceWarpStage::new(toolbox.clone()))
        .add_stage(ConcatTransformStage::new(toolbox.clone()))
        .add_stage(
            CleanupStage::new(toolbox.caching())
                .keep(keys::COREG_ANAT)
                .keep(keys::COREG_TRANSFORM),
        )
        .build()
}

/// Stages bringing anat and CEST into template space
pub fn template_pipeline(toolbox: &Toolbox, registrar: Arc<dyn TemplateRegistrar>) -> Pipeline {
    Pipeline::builder("template-registration")
        .add_stage(AnatToTemplateStage::new(toolbox.clone(), registrar))
        .add_stage(CestToTemplateStage::new(toolbox.clone()))
        .add_stage(
            CleanupStage::new(toolbox.caching())
                .keep(keys::REGISTERED_ANAT)
                .keep(keys::PRE_TRANSFORM)
                .keep(keys::TEMPLATE_TRANSFORM)
                .keep(keys::REGISTERED_CEST),
        )
        .build()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Context fixtures for stage tests

    use super::keys;
    use crate::pipeline::PipelineContext;
    use std::path::Path;

    pub fn context(anat: &Path, cest: &Path, output_dir: &Path) -> PipelineContext {
        let mut context = PipelineContext::new("session-test");
        context.set_path(keys::ANAT, anat);
        context.set_path(keys::CEST, cest);
        context.set_path(keys::OUTPUT_DIR, output_dir);
        context
    }
}
