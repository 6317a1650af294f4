use super::keys;
use crate::error::CestResult;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::registration::{TemplateOptions, TemplateRegistrar, TemplateTransformer, Toolbox};
use crate::transform::{Transform, TransformChain};
use std::sync::Arc;
use std::time::Duration;

/// Stage registering the raw anat to the template
///
/// # Context Requirements
/// - `anat`, `template`, `output_dir` (paths)
/// - `template_options` (optional, defaults when absent)
///
/// # Context Outputs
/// - `registered_anat` (path)
/// - `pre_transform`, `template_transform` (Transforms as JSON)
pub struct AnatToTemplateStage {
    toolbox: Toolbox,
    registrar: Arc<dyn TemplateRegistrar>,
}

impl AnatToTemplateStage {
    pub fn new(toolbox: Toolbox, registrar: Arc<dyn TemplateRegistrar>) -> Self {
        Self { toolbox, registrar }
    }
}

impl PipelineStage for AnatToTemplateStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let anat = context.get_path(keys::ANAT)?;
        let template = context.get_path(keys::TEMPLATE)?;
        let output_dir = context.get_path(keys::OUTPUT_DIR)?;
        let options: TemplateOptions = if context.has(keys::TEMPLATE_OPTIONS) {
            context.get_json(keys::TEMPLATE_OPTIONS)?
        } else {
            TemplateOptions::default()
        };

        let registration =
            self.registrar
                .register(&self.toolbox, &anat, &template, &options, &output_dir)?;

        // Affine output only serves as the nonlinear step's source
        context.add_artifact(registration.transform.from_space());
        context.set_path(keys::REGISTERED_ANAT, registration.registered_anat);
        context.set_json(keys::PRE_TRANSFORM, &registration.pre_transform)?;
        context.set_json(keys::TEMPLATE_TRANSFORM, &registration.transform)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Anat to Template"
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(600))
    }
}

/// Stage carrying the raw CEST volume into template space
///
/// The chain runs CEST to anat (the coregistration transform traversed
/// backwards), anat to the affine output, then on to the template.
///
/// # Context Outputs
/// - `registered_cest` (path)
pub struct CestToTemplateStage {
    toolbox: Toolbox,
}

impl CestToTemplateStage {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }

    fn chain(context: &PipelineContext) -> CestResult<TransformChain> {
        let coreg: Transform = context.get_json(keys::COREG_TRANSFORM)?;
        let pre: Transform = context.get_json(keys::PRE_TRANSFORM)?;
        let transform: Transform = context.get_json(keys::TEMPLATE_TRANSFORM)?;
        Ok(TransformChain::new(vec![coreg.reversed(), pre, transform]))
    }
}

impl PipelineStage for CestToTemplateStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let cest = context.get_path(keys::CEST)?;
        let template = context.get_path(keys::TEMPLATE)?;
        let output_dir = context.get_path(keys::OUTPUT_DIR)?;
        let chain = Self::chain(context)?;

        let registered = TemplateTransformer::new(&self.toolbox)
            .in_dir(&output_dir)
            .to_template(
                &cest,
                &template,
                &chain,
                self.toolbox.config().template_voxel_size,
            )?;

        context.set_path(keys::REGISTERED_CEST, registered);
        Ok(())
    }

    fn name(&self) -> &str {
        "CEST to Template"
    }

    fn pre_execute(&self, context: &PipelineContext) -> CestResult<()> {
        Self::chain(context)?.validate()
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }
}
