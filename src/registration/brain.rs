use super::{output_dir_for, Toolbox};
use crate::artifacts::IntermediateArtifactSet;
use crate::config::MaskStrategy;
use crate::error::{CestError, CestResult};
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use std::path::{Path, PathBuf};

/// Skull stripping: bias correction, clip level, mask, multiply
pub struct BrainExtractor<'a> {
    toolbox: &'a Toolbox,
    output_dir: Option<PathBuf>,
}

impl<'a> BrainExtractor<'a> {
    pub fn new(toolbox: &'a Toolbox) -> Self {
        Self {
            toolbox,
            output_dir: None,
        }
    }

    /// Write outputs to `dir` instead of next to the head volume
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Compute the brain mask of `head`, returning the mask path plus the
    /// intermediates produced on the way.
    ///
    /// # Errors
    /// `ToolUnavailable` before any processing when the morphological
    /// strategy is selected and its program is not installed.
    pub fn compute_mask(
        &self,
        head: &Path,
        brain_volume: u32,
        strategy: MaskStrategy,
    ) -> CestResult<(PathBuf, IntermediateArtifactSet)> {
        let tools = self.toolbox.tools();
        let mask_program = tools.mask_program(strategy);
        if strategy == MaskStrategy::Morphological {
            self.toolbox.require(mask_program).map_err(|_| {
                CestError::ToolUnavailable(format!(
                    "can not locate {} required by the morphological mask strategy",
                    mask_program
                ))
            })?;
        }

        let dir = output_dir_for(head, self.output_dir.as_deref());
        let mut intermediates = IntermediateArtifactSet::new();

        let head_for_mask = if self.toolbox.config().bias_correct {
            let unifized = paths::derive(head, Some("_unifized"), None, Some(&dir))?;
            let call = self
                .toolbox
                .call(&tools.unifize)
                .opt("-prefix", &unifized)
                .opt("-input", head)
                .output("out_file", &unifized);
            self.toolbox.run(&call)?;
            intermediates.push(&unifized);
            unifized
        } else {
            head.to_path_buf()
        };

        let clip = self
            .toolbox
            .call(&tools.clip_level)
            .arg(&head_for_mask);
        let clip_output = self.toolbox.run(&clip)?;
        let clip_level: f64 = clip_output
            .stdout
            .split_whitespace()
            .last()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| {
                CestError::tool(
                    &tools.clip_level,
                    format!("no clip level in output {:?}", clip_output.stdout),
                )
            })?;

        let mask = paths::derive(head, Some("_mask"), None, Some(&dir))?;
        let call = self
            .toolbox
            .call(mask_program)
            .arg(&head_for_mask)
            .arg(&mask)
            .opt("-v", brain_volume.to_string())
            .opt("-t", (clip_level as i64).to_string())
            .output("out_file", &mask);
        self.toolbox.run(&call)?;

        app_log!(
            LogLevel::Debug,
            "registration::brain",
            "Brain mask of {} computed with {} (clip level {})",
            head.display(),
            mask_program,
            clip_level as i64
        );
        Ok((mask, intermediates))
    }

    /// Extract the brain of `head`.
    ///
    /// The mask and bias-corrected head are removed afterwards unless
    /// caching is enabled; only `<stem>_brain<ext>` remains.
    pub fn extract(
        &self,
        head: &Path,
        brain_volume: u32,
        strategy: MaskStrategy,
    ) -> CestResult<PathBuf> {
        let (mask, mut intermediates) = self.compute_mask(head, brain_volume, strategy)?;
        intermediates.push(&mask);

        let dir = output_dir_for(head, self.output_dir.as_deref());
        let brain = paths::derive(head, Some("_brain"), None, Some(&dir))?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().calc)
            .opt("-a", head)
            .opt("-b", &mask)
            .opt("-expr", "a*b")
            .opt("-prefix", &brain)
            .output("out_file", &brain);
        self.toolbox.run(&call)?;

        intermediates.cleanup(self.toolbox.caching(), &[brain.as_path()], "registration::brain");
        Ok(brain)
    }
}
