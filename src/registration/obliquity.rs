use super::Toolbox;
use crate::error::{CestError, CestResult};
use crate::app_log;
use crate::logger::LogLevel;
use crate::paths;
use std::path::{Path, PathBuf};

/// Re-applies the oblique orientation header of a trusted reference.
///
/// Several warping and slicing programs silently reset a volume's
/// index-to-world transform to an axis-aligned one. Every stage calling
/// such a program runs the fixer on its output right away.
pub struct ObliquityFixer<'a> {
    toolbox: &'a Toolbox,
}

impl<'a> ObliquityFixer<'a> {
    pub fn new(toolbox: &'a Toolbox) -> Self {
        Self { toolbox }
    }

    /// Copy `reference`'s orientation into `volume`.
    ///
    /// With `overwrite` the header is edited in place; otherwise the volume
    /// is first copied to `<stem>_oblique<ext>` and the copy is returned.
    ///
    /// # Errors
    /// `HeaderFix` when either volume cannot be read.
    pub fn fix(&self, volume: &Path, reference: &Path, overwrite: bool) -> CestResult<PathBuf> {
        let reader = self.toolbox.reader();
        reader
            .orientation(volume)
            .map_err(|e| CestError::HeaderFix(format!("cannot read {}: {}", volume.display(), e)))?;
        reader.orientation(reference).map_err(|e| {
            CestError::HeaderFix(format!("cannot read reference {}: {}", reference.display(), e))
        })?;

        let tools = self.toolbox.tools();
        let target = if overwrite {
            volume.to_path_buf()
        } else {
            let target = paths::with_suffix(volume, "_oblique")?;
            let copy = self
                .toolbox
                .call(&tools.copy)
                .arg(volume)
                .arg(&target)
                .output("out_file", &target);
            self.toolbox.run(&copy)?;
            target
        };

        // Edits the file in place, so it is never served from the cache
        let refit = self
            .toolbox
            .call(&tools.refit)
            .opt_n(
                "-atrcopy",
                [reference.to_string_lossy().to_string(), "IJK_TO_DICOM_REAL".to_string()],
            )
            .arg(&target)
            .output("out_file", &target)
            .uncached();
        self.toolbox.run(&refit)?;

        app_log!(
            LogLevel::Debug,
            "registration::obliquity",
            "Copied orientation of {} onto {}",
            reference.display(),
            target.display()
        );
        Ok(target)
    }
}
