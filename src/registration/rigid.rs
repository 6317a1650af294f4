use super::{output_dir_for, BrainExtractor, Toolbox};
use crate::artifacts::IntermediateArtifactSet;
use crate::config::MaskStrategy;
use crate::error::CestResult;
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use crate::transform::{Transform, TransformDirection, TransformKind};
use std::path::{Path, PathBuf};

/// Output of a rigid alignment
#[derive(Debug, Clone, PartialEq)]
pub struct RigidAlignment {
    /// Moving head resampled onto the reference grid
    pub aligned: PathBuf,
    /// Inverse of the estimated matrix, the one applied to the moving head
    pub transform: Transform,
}

/// Shift-and-rotate alignment of two heads via their brains
pub struct RigidAligner<'a> {
    toolbox: &'a Toolbox,
    output_dir: Option<PathBuf>,
}

impl<'a> RigidAligner<'a> {
    pub fn new(toolbox: &'a Toolbox) -> Self {
        Self {
            toolbox,
            output_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Align `moving_head` onto `reference_head`.
    ///
    /// The matrix is estimated from the reference brain to the moving brain
    /// and then inverted. The inverse is what gets applied to the moving
    /// head and what is returned. Brains, the forward matrix and the
    /// estimation output are removed unless caching.
    pub fn align(
        &self,
        moving_head: &Path,
        reference_head: &Path,
        brain_volume: u32,
        strategy: MaskStrategy,
    ) -> CestResult<RigidAlignment> {
        let dir = output_dir_for(moving_head, self.output_dir.as_deref());
        let tools = self.toolbox.tools();
        let mut intermediates = IntermediateArtifactSet::new();

        let extractor = BrainExtractor::new(self.toolbox).in_dir(&dir);
        let moving_brain = extractor.extract(moving_head, brain_volume, strategy)?;
        let reference_brain = extractor.extract(reference_head, brain_volume, strategy)?;
        intermediates.push(&moving_brain);
        intermediates.push(&reference_brain);

        // Reference brain is the source, moving brain the base
        let forward = paths::derive(moving_head, Some("_rigid_forward"), Some(".aff12.1D"), Some(&dir))?;
        let estimated = paths::derive(&reference_brain, Some("_shr"), None, Some(&dir))?;
        let call = self
            .toolbox
            .call(&tools.allineate)
            .opt("-base", &moving_brain)
            .opt("-source", &reference_brain)
            .opt("-warp", "shift_rotate")
            .opt("-1Dmatrix_save", &forward)
            .opt("-prefix", &estimated)
            .output("out_file", &estimated)
            .output("matrix", &forward);
        self.toolbox.run(&call)?;
        intermediates.push(&forward);
        intermediates.push(&estimated);

        let inverse = paths::derive(moving_head, Some("_rigid"), Some(".aff12.1D"), Some(&dir))?;
        let call = self
            .toolbox
            .call(&tools.cat_matvec)
            .flag("-ONELINE")
            .arg(&forward)
            .flag("-I")
            .stdout_to(&inverse)
            .output("matrix", &inverse);
        self.toolbox.run(&call)?;

        let aligned = paths::derive(moving_head, Some("_allineated"), None, Some(&dir))?;
        let call = self
            .toolbox
            .call(&tools.allineate)
            .opt("-source", moving_head)
            .opt("-master", reference_head)
            .opt("-1Dmatrix_apply", &inverse)
            .opt("-prefix", &aligned)
            .output("out_file", &aligned);
        self.toolbox.run(&call)?;

        intermediates.cleanup(self.toolbox.caching(), &[], "registration::rigid");

        app_log!(
            LogLevel::Info,
            "registration::rigid",
            "Rigid alignment of {} onto {} written to {}",
            moving_head.display(),
            reference_head.display(),
            aligned.display()
        );

        Ok(RigidAlignment {
            aligned,
            transform: Transform::new(
                inverse,
                TransformKind::Affine,
                TransformDirection::Forward,
                moving_head,
                reference_head,
            ),
        })
    }
}
