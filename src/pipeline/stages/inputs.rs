use super::keys;
use crate::error::{CestError, CestResult};
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::registration::Toolbox;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Stage that copies the raw volumes into the output directory
///
/// Every later artifact is derived from these copies, so the raw inputs are
/// never touched. A volume already living in the output directory is used
/// as is. Inputs sharing a file name are copied to `<stem>_anat` and
/// `<stem>_cest` so neither copy overwrites the other.
///
/// # Context Requirements
/// - `anat`, `cest` (paths) - Raw volumes
/// - `output_dir` (path)
///
/// # Context Outputs
/// - `anat_copy`, `cest_copy` (paths)
pub struct CopyInputsStage {
    toolbox: Toolbox,
}

impl CopyInputsStage {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }

    /// Destinations of the anat and CEST copies
    pub fn targets(anat: &Path, cest: &Path, output_dir: &Path) -> CestResult<(PathBuf, PathBuf)> {
        let anat_target = paths::in_directory(anat, output_dir)?;
        let cest_target = paths::in_directory(cest, output_dir)?;
        if anat_target != cest_target {
            return Ok((anat_target, cest_target));
        }
        Ok((
            paths::derive(anat, Some("_anat"), None, Some(output_dir))?,
            paths::derive(cest, Some("_cest"), None, Some(output_dir))?,
        ))
    }

    fn copy_into(&self, volume: &Path, target: PathBuf, context: &PipelineContext) -> CestResult<PathBuf> {
        if target == volume {
            return Ok(target);
        }

        let call = self
            .toolbox
            .call(&self.toolbox.tools().copy)
            .arg(volume)
            .arg(&target)
            .output("out_file", &target);
        self.toolbox.run(&call)?;

        app_log!(
            LogLevel::Info,
            "pipeline::inputs",
            "Copied {} to {} (session: {})",
            volume.display(),
            target.display(),
            context.session_id()
        );
        Ok(target)
    }
}

impl PipelineStage for CopyInputsStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let output_dir = context.get_path(keys::OUTPUT_DIR)?;
        std::fs::create_dir_all(&output_dir)?;

        let anat = context.get_path(keys::ANAT)?;
        let cest = context.get_path(keys::CEST)?;
        let (anat_target, cest_target) = Self::targets(&anat, &cest, &output_dir)?;

        let cest = self.copy_into(&cest, cest_target, context)?;
        let anat = self.copy_into(&anat, anat_target, context)?;

        context.set_path(keys::CEST_COPY, cest);
        context.set_path(keys::ANAT_COPY, anat);
        Ok(())
    }

    fn name(&self) -> &str {
        "Copy Inputs"
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    fn pre_execute(&self, context: &PipelineContext) -> CestResult<()> {
        for key in [keys::ANAT, keys::CEST] {
            let path = context.get_path(key)?;
            if !path.is_file() {
                return Err(CestError::MissingInput(path.display().to_string()));
            }
        }
        Ok(())
    }
}
