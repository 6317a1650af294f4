use super::{output_dir_for, BrainExtractor, Toolbox};
use crate::artifacts::IntermediateArtifactSet;
use crate::error::{CestError, CestResult};
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use crate::transform::{Transform, TransformChain, TransformDirection, TransformKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Interpolation used for the single template resampling pass
const TEMPLATE_INTERPOLATION: &str = "wsinc5";

/// Output of registering an anatomical volume to a template
#[derive(Debug, Clone, PartialEq)]
pub struct AnatRegistration {
    pub registered_anat: PathBuf,
    /// Affine step, anat onto the template
    pub pre_transform: Transform,
    /// Nonlinear step, affine output onto the template
    pub transform: Transform,
}

impl AnatRegistration {
    /// Chain carrying data from `anat` space into template space
    pub fn chain(&self) -> TransformChain {
        TransformChain::new(vec![self.pre_transform.clone(), self.transform.clone()])
    }
}

/// Optional inputs of anat to template registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateOptions {
    /// Brain-only template. When given, the affine step aligns the
    /// extracted anat brain to it instead of aligning heads.
    pub brain_template: Option<PathBuf>,
    /// Weight volume restricting the nonlinear step
    pub dilated_head_mask: Option<PathBuf>,
    /// Finest refinement level of the nonlinear step
    pub maxlev: Option<u32>,
}

impl TemplateOptions {
    pub fn brain_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.brain_template = Some(path.into());
        self
    }

    pub fn dilated_head_mask(mut self, path: impl Into<PathBuf>) -> Self {
        self.dilated_head_mask = Some(path.into());
        self
    }

    pub fn maxlev(mut self, level: u32) -> Self {
        self.maxlev = Some(level);
        self
    }

    /// Files the options refer to
    pub fn files(&self) -> impl Iterator<Item = (&'static str, &Path)> {
        [
            ("brain template", self.brain_template.as_deref()),
            ("dilated head mask", self.dilated_head_mask.as_deref()),
        ]
        .into_iter()
        .filter_map(|(role, path)| path.map(|p| (role, p)))
    }
}

/// Anatomical-to-template registration collaborator
pub trait TemplateRegistrar: Send + Sync {
    fn register(
        &self,
        toolbox: &Toolbox,
        anat: &Path,
        template: &Path,
        options: &TemplateOptions,
        output_dir: &Path,
    ) -> CestResult<AnatRegistration>;
}

/// Affine then nonlinear registration of the anat to the template
///
/// The affine step aligns heads, or the extracted brain to
/// `brain_template` when one is given; the nonlinear step always works on
/// the head.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffineWarpRegistrar;

impl AffineWarpRegistrar {
    /// Affine step onto the template grid, returning the moved head and
    /// its matrix
    fn affine(
        toolbox: &Toolbox,
        anat: &Path,
        template: &Path,
        options: &TemplateOptions,
        output_dir: &Path,
        intermediates: &mut IntermediateArtifactSet,
    ) -> CestResult<(PathBuf, PathBuf)> {
        let tools = toolbox.tools();
        let affine = paths::derive(anat, Some("_affine"), None, Some(output_dir))?;
        let matrix = paths::derive(anat, Some("_affine"), Some(".aff12.1D"), Some(output_dir))?;

        let brain_template = match &options.brain_template {
            Some(brain_template) => brain_template,
            None => {
                let call = toolbox
                    .call(&tools.allineate)
                    .opt("-base", template)
                    .opt("-source", anat)
                    .opt("-warp", "affine_general")
                    .opt("-1Dmatrix_save", &matrix)
                    .opt("-prefix", &affine)
                    .output("out_file", &affine)
                    .output("matrix", &matrix);
                toolbox.run(&call)?;
                return Ok((affine, matrix));
            }
        };

        let config = toolbox.config();
        let brain = BrainExtractor::new(toolbox).in_dir(output_dir).extract(
            anat,
            config.brain_volume,
            config.mask_strategy,
        )?;
        intermediates.push(&brain);

        let brain_affine = paths::derive(&brain, Some("_affine"), None, Some(output_dir))?;
        let call = toolbox
            .call(&tools.allineate)
            .opt("-base", brain_template)
            .opt("-source", &brain)
            .opt("-warp", "affine_general")
            .opt("-1Dmatrix_save", &matrix)
            .opt("-prefix", &brain_affine)
            .output("out_file", &brain_affine)
            .output("matrix", &matrix);
        toolbox.run(&call)?;
        intermediates.push(&brain_affine);

        // Brain matrix applied to the head
        let call = toolbox
            .call(&tools.allineate)
            .opt("-1Dmatrix_apply", &matrix)
            .opt("-source", anat)
            .opt("-master", template)
            .opt("-prefix", &affine)
            .output("out_file", &affine);
        toolbox.run(&call)?;
        Ok((affine, matrix))
    }
}

impl TemplateRegistrar for AffineWarpRegistrar {
    fn register(
        &self,
        toolbox: &Toolbox,
        anat: &Path,
        template: &Path,
        options: &TemplateOptions,
        output_dir: &Path,
    ) -> CestResult<AnatRegistration> {
        let tools = toolbox.tools();
        let mut intermediates = IntermediateArtifactSet::new();
        let (affine, matrix) =
            Self::affine(toolbox, anat, template, options, output_dir, &mut intermediates)?;

        let registered = paths::derive(anat, Some("_registered"), None, Some(output_dir))?;
        let warp = paths::with_suffix(&registered, "_WARP")?;
        let mut call = toolbox
            .call(&tools.qwarp)
            .opt("-base", template)
            .opt("-source", &affine);
        if let Some(mask) = &options.dilated_head_mask {
            call = call.opt("-weight", mask);
        }
        if let Some(level) = options.maxlev {
            call = call.opt("-maxlev", level.to_string());
        }
        let call = call
            .opt("-prefix", &registered)
            .output("out_file", &registered)
            .output("warp", &warp);
        toolbox.run(&call)?;

        intermediates.cleanup(toolbox.caching(), &[], "registration::template");

        app_log!(
            LogLevel::Info,
            "registration::template",
            "Registered {} to template {}",
            anat.display(),
            template.display()
        );

        Ok(AnatRegistration {
            registered_anat: registered,
            pre_transform: Transform::new(
                matrix,
                TransformKind::Affine,
                TransformDirection::Forward,
                anat,
                &affine,
            ),
            transform: Transform::new(
                warp,
                TransformKind::Nonlinear,
                TransformDirection::Forward,
                &affine,
                template,
            ),
        })
    }
}

/// Brings volumes into template space in one resampling pass
pub struct TemplateTransformer<'a> {
    toolbox: &'a Toolbox,
    output_dir: Option<PathBuf>,
}

impl<'a> TemplateTransformer<'a> {
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

    /// Apply `chain` to `volume` on the grid of `template`.
    ///
    /// With `target_voxel_size` the template is first resampled to that
    /// spacing and the result is written on the resampled grid. The chain
    /// must be non-empty, its adjacent endpoints must agree and it must end
    /// in `template`.
    pub fn to_template(
        &self,
        volume: &Path,
        template: &Path,
        chain: &TransformChain,
        target_voxel_size: Option<(f64, f64, f64)>,
    ) -> CestResult<PathBuf> {
        let spec = chain.warp_spec()?;
        if let Some(last) = chain.transforms().last() {
            if last.to_space() != template {
                return Err(CestError::TransformChain(format!(
                    "chain ends in {} instead of template {}",
                    last.to_space().display(),
                    template.display()
                )));
            }
        }

        let dir = output_dir_for(volume, self.output_dir.as_deref());
        let mut intermediates = IntermediateArtifactSet::new();

        let grid = match target_voxel_size {
            Some((dx, dy, dz)) => {
                let resampled = paths::derive(template, Some("_resampled"), None, Some(&dir))?;
                let call = self
                    .toolbox
                    .call(&self.toolbox.tools().resample)
                    .opt_n("-dxyz", [dx, dy, dz])
                    .opt("-rmode", "Cu")
                    .opt("-prefix", &resampled)
                    .opt("-input", template)
                    .output("out_file", &resampled);
                self.toolbox.run(&call)?;
                intermediates.push(&resampled);
                resampled
            }
            None => template.to_path_buf(),
        };

        let normalized = paths::derive(volume, Some("_to_template"), None, Some(&dir))?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().nwarp_apply)
            .opt("-nwarp", &spec)
            .opt("-source", volume)
            .opt("-master", &grid)
            .opt("-interp", TEMPLATE_INTERPOLATION)
            .opt("-prefix", &normalized)
            .output("out_file", &normalized);
        self.toolbox.run(&call)?;

        intermediates.cleanup(self.toolbox.caching(), &[], "registration::template");

        app_log!(
            LogLevel::Info,
            "registration::template",
            "{} brought into template space through {} transforms",
            volume.display(),
            chain.len()
        );
        Ok(normalized)
    }
}
