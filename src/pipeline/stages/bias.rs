use super::keys;
use crate::error::CestResult;
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::registration::Toolbox;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Stage that corrects intensity bias of both copied volumes
///
/// # Context Requirements
/// - `anat_copy`, `cest_copy`, `output_dir` (paths)
///
/// # Context Outputs
/// - `anat_unbiased`, `cest_unbiased` (paths, tracked as intermediates)
pub struct BiasCorrectStage {
    toolbox: Toolbox,
}

impl BiasCorrectStage {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }

    fn unifize(&self, volume: &Path, output_dir: &Path) -> CestResult<PathBuf> {
        let out = paths::derive(volume, Some("_unifized"), None, Some(output_dir))?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().unifize)
            .opt("-prefix", &out)
            .opt("-input", volume)
            .output("out_file", &out);
        self.toolbox.run(&call)?;
        Ok(out)
    }
}

impl PipelineStage for BiasCorrectStage {
    fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
        let output_dir = context.get_path(keys::OUTPUT_DIR)?;

        let cest = self.unifize(&context.get_path(keys::CEST_COPY)?, &output_dir)?;
        let anat = self.unifize(&context.get_path(keys::ANAT_COPY)?, &output_dir)?;

        app_log!(
            LogLevel::Info,
            "pipeline::bias",
            "Bias corrected {} and {} (session: {})",
            anat.display(),
            cest.display(),
            context.session_id()
        );

        context.add_artifact(&cest);
        context.add_artifact(&anat);
        context.set_path(keys::CEST_UNBIASED, cest);
        context.set_path(keys::ANAT_UNBIASED, anat);
        Ok(())
    }

    fn name(&self) -> &str {
        "Bias Correction"
    }

    fn estimated_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::stages::testing::context;
    use crate::registration::testing::{block, toolbox, write};
    use crate::tools::mock::MockToolbox;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_unifizes_both_volumes() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockToolbox::new());
        let tb = toolbox(&mock, PipelineConfig::default(), dir.path());
        let anat = write(&dir, "anat.nii", &block([4, 4, 2], [1, 1, 0], 2));
        let cest = write(&dir, "cest.nii", &block([4, 4, 2], [1, 1, 0], 2));

        let mut ctx = context(&anat, &cest, dir.path());
        ctx.set_path(keys::ANAT_COPY, &anat);
        ctx.set_path(keys::CEST_COPY, &cest);
        BiasCorrectStage::new(tb).execute(&mut ctx).unwrap();

        assert_eq!(
            ctx.get_path(keys::ANAT_UNBIASED).unwrap(),
            dir.path().join("anat_unifized.nii")
        );
        assert_eq!(ctx.artifacts().len(), 2);
        assert_eq!(mock.count("3dUnifize"), 2);
    }

    #[test]
    fn test_requires_copies() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockToolbox::new());
        let tb = toolbox(&mock, PipelineConfig::default(), dir.path());
        let mut ctx = context(&dir.path().join("a.nii"), &dir.path().join("c.nii"), dir.path());

        assert!(BiasCorrectStage::new(tb).execute(&mut ctx).is_err());
        assert!(mock.calls().is_empty());
    }
}
