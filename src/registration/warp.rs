use super::{output_dir_for, ObliquityFixer, Toolbox};
use crate::artifacts::IntermediateArtifactSet;
use crate::error::CestResult;
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use std::path::{Path, PathBuf};

/// Output of a whole-volume warp
#[derive(Debug, Clone, PartialEq)]
pub struct WarpResult {
    /// Source on the reference grid, with the reference's oblique header
    pub warped: PathBuf,
    /// Matrix captured from the warp program's log
    pub matrix: PathBuf,
    /// Files the caller should remove once its own stage succeeds
    pub intermediates: IntermediateArtifactSet,
}

/// Whole-volume warp of a source onto a reference grid
pub struct NonlinearWarper<'a> {
    toolbox: &'a Toolbox,
    output_dir: Option<PathBuf>,
}

impl<'a> NonlinearWarper<'a> {
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

    /// Warp `source` onto `reference` with quintic interpolation.
    ///
    /// The warp program prints its obliquity matrix instead of writing it;
    /// the log is saved verbatim to `<source stem>_warp.mat` unless that
    /// file already exists.
    pub fn warp(&self, source: &Path, reference: &Path) -> CestResult<WarpResult> {
        let dir = output_dir_for(source, self.output_dir.as_deref());
        let mut intermediates = IntermediateArtifactSet::new();

        let warped = paths::derive(source, Some("_warped"), None, Some(&dir))?;
        let call = self
            .toolbox
            .call(&self.toolbox.tools().warp)
            .flag("-verb")
            .opt("-oblique_parent", reference)
            .flag("-quintic")
            .opt("-prefix", &warped)
            .arg(source)
            .output("out_file", &warped);
        let outputs = self.toolbox.run(&call)?;

        let fixed = ObliquityFixer::new(self.toolbox).fix(
            &warped,
            reference,
            self.toolbox.overwrite_headers(),
        )?;
        if fixed != warped {
            intermediates.push(&warped);
        }

        let matrix = paths::derive(source, Some("_warp"), Some(".mat"), Some(&dir))?;
        if !matrix.exists() {
            std::fs::write(&matrix, &outputs.stdout)?;
        }

        app_log!(
            LogLevel::Info,
            "registration::warp",
            "Warped {} onto {}",
            source.display(),
            reference.display()
        );

        Ok(WarpResult {
            warped: fixed,
            matrix,
            intermediates,
        })
    }
}
