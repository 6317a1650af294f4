/// State transition implementations
///
/// Each transition consumes the current session and returns the next one,
/// or the error that ended it.
use super::states::*;
use super::CestSession;
use crate::error::{CestError, CestResult};
use crate::app_log;
use crate::logger::LogLevel;
use crate::pipeline::stages::{coregistration_pipeline, keys, template_pipeline};
use crate::pipeline::PipelineContext;
use crate::registration::TemplateOptions;
use crate::transform::Transform;
use std::path::{Path, PathBuf};

fn require_file(role: &str, path: &Path) -> CestResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CestError::MissingInput(format!(
            "{} volume {} does not exist",
            role,
            path.display()
        )))
    }
}

impl<S> CestSession<S> {
    /// Context seeded with the inputs every pipeline reads
    fn context(&self) -> PipelineContext {
        let mut context = PipelineContext::new(self.session_id.to_string());
        context.set_path(keys::ANAT, &self.metadata.anat);
        context.set_path(keys::CEST, &self.metadata.cest);
        context.set_path(keys::OUTPUT_DIR, &self.metadata.output_dir);
        if let Some(subject) = &self.metadata.subject_id {
            context.set_metadata("subject_id", subject.as_str());
        }
        context
    }
}

// ============================================================================
// Uninitialized State Transitions
// ============================================================================

impl CestSession<Uninitialized> {
    /// Check inputs, configuration and required programs, then create the
    /// output directory
    pub fn validate(self) -> CestResult<CestSession<InputsValidated>> {
        require_file("anat", &self.metadata.anat)?;
        require_file("CEST", &self.metadata.cest)?;
        self.toolbox.config().validate()?;
        self.toolbox
            .config()
            .validate_tools(self.toolbox.runner())?;
        std::fs::create_dir_all(&self.metadata.output_dir)?;

        app_log!(
            LogLevel::Info,
            "session",
            "Inputs validated, writing to {} (session: {})",
            self.metadata.output_dir.display(),
            self.session_id
        );
        Ok(self.advance(InputsValidated::new()))
    }
}

// ============================================================================
// InputsValidated State Transitions
// ============================================================================

impl CestSession<InputsValidated> {
    /// Warp the anat onto the CEST volume
    pub fn coregister(self) -> CestResult<CestSession<Coregistered>> {
        let mut context = self.context();
        let report = coregistration_pipeline(&self.toolbox).execute(&mut context)?;

        let slice_transforms = if context.has(keys::SLICE_TRANSFORMS) {
            Some(context.get_json::<Vec<Option<PathBuf>>>(keys::SLICE_TRANSFORMS)?)
        } else {
            None
        };
        let coregistration = Coregistration {
            coreg_anat: context.get_path(keys::COREG_ANAT)?,
            coreg_transform: context.get_json(keys::COREG_TRANSFORM)?,
            slice_transforms,
            report,
        };

        app_log!(
            LogLevel::Info,
            "session",
            "Coregistration complete: {} (session: {})",
            coregistration.coreg_anat.display(),
            self.session_id
        );
        Ok(self.advance(Coregistered { coregistration }))
    }
}

// ============================================================================
// Coregistered State Transitions
// ============================================================================

impl CestSession<Coregistered> {
    /// Register the anat to `template` and carry the CEST volume along
    pub fn register_to_template(
        self,
        template: impl Into<PathBuf>,
    ) -> CestResult<CestSession<TemplateRegistered>> {
        self.register_to_template_with(template, TemplateOptions::default())
    }

    /// [`register_to_template`](Self::register_to_template) with a brain
    /// template, a dilated head mask or a warp level limit
    pub fn register_to_template_with(
        self,
        template: impl Into<PathBuf>,
        options: TemplateOptions,
    ) -> CestResult<CestSession<TemplateRegistered>> {
        let template = template.into();
        require_file("template", &template)?;
        for (role, path) in options.files() {
            require_file(role, path)?;
        }

        let mut context = self.context();
        context.set_path(keys::TEMPLATE, &template);
        context.set_json(keys::TEMPLATE_OPTIONS, &options)?;
        context.set_json(
            keys::COREG_TRANSFORM,
            &self.state.coregistration.coreg_transform,
        )?;
        let report = template_pipeline(&self.toolbox, self.registrar.clone())
            .execute(&mut context)?;

        let template_registration = TemplateRegistration {
            template,
            registered_anat: context.get_path(keys::REGISTERED_ANAT)?,
            pre_transform: context.get_json::<Transform>(keys::PRE_TRANSFORM)?,
            transform: context.get_json::<Transform>(keys::TEMPLATE_TRANSFORM)?,
            registered_cest: context.get_path(keys::REGISTERED_CEST)?,
            report,
        };

        app_log!(
            LogLevel::Info,
            "session",
            "Template registration complete: {} (session: {})",
            template_registration.registered_cest.display(),
            self.session_id
        );
        let coregistration = self.state.coregistration.clone();
        Ok(self.advance(TemplateRegistered {
            coregistration,
            template_registration,
        }))
    }
}
