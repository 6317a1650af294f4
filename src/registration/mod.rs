//! Registration building blocks
//!
//! Each component is a thin orchestration layer over external programs:
//! it derives artifact names, issues tool calls through a shared `Toolbox`,
//! re-applies oblique headers after tools that drop them, and tracks the
//! intermediates it produced.
//!
//! ```text
//! BrainExtractor ──▶ RigidAligner ──▶ NonlinearWarper / SliceWarper
//!                                              │
//!                       TemplateRegistrar ──▶ TemplateTransformer
//! ```

pub mod brain;
pub mod obliquity;
pub mod rigid;
pub mod slice_warp;
pub mod template;
pub mod warp;

pub use brain::BrainExtractor;
pub use obliquity::ObliquityFixer;
pub use rigid::{RigidAligner, RigidAlignment};
pub use slice_warp::{SliceWarpResult, SliceWarper};
pub use template::{
    AffineWarpRegistrar, AnatRegistration, TemplateOptions, TemplateRegistrar,
    TemplateTransformer,
};
pub use warp::{NonlinearWarper, WarpResult};

use crate::config::{PipelineConfig, ToolCatalog};
use crate::error::{CestError, CestResult};
use crate::tools::{CacheStore, JsonCacheStore, ToolCall, ToolInvoker, ToolOutputs, ToolRunner};
use crate::volume::ImageReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a registration component needs to talk to the outside world
#[derive(Clone)]
pub struct Toolbox {
    invoker: ToolInvoker,
    reader: Arc<dyn ImageReader>,
    config: Arc<PipelineConfig>,
}

impl Toolbox {
    /// Build a toolbox rooted at `working_dir`.
    ///
    /// With caching enabled, invocation records are stored under
    /// `working_dir` as well.
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        reader: Arc<dyn ImageReader>,
        config: PipelineConfig,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        let working_dir = working_dir.into();
        let mut invoker = ToolInvoker::new(runner, &working_dir)
            .with_timeout(config.tool_timeout())
            .with_verbosity(config.verbosity);
        if config.caching {
            invoker = invoker.with_cache(Arc::new(JsonCacheStore::new(&working_dir)));
        }
        Self {
            invoker,
            reader,
            config: Arc::new(config),
        }
    }

    /// Replace the cache backend
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.invoker = self.invoker.with_cache(cache);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolCatalog {
        &self.config.tools
    }

    pub fn caching(&self) -> bool {
        self.config.caching
    }

    pub fn reader(&self) -> &dyn ImageReader {
        self.reader.as_ref()
    }

    pub fn runner(&self) -> &dyn ToolRunner {
        self.invoker.runner()
    }

    pub fn working_dir(&self) -> &Path {
        self.invoker.working_dir()
    }

    /// New call for `program` carrying the configured environment
    pub fn call(&self, program: &str) -> ToolCall {
        ToolCall::new(program).environ(&self.config.environ)
    }

    /// Invoke a call, honouring the caching flag
    pub fn run(&self, call: &ToolCall) -> CestResult<ToolOutputs> {
        self.invoker.invoke(call, self.config.caching)
    }

    /// Fail with `ToolUnavailable` unless `program` is installed
    pub fn require(&self, program: &str) -> CestResult<()> {
        match self.runner().locate(program) {
            Some(_) => Ok(()),
            None => Err(CestError::ToolUnavailable(format!("can not locate {}", program))),
        }
    }

    /// Whether headers are fixed in place; under caching they are written
    /// to new files so cached outputs are never mutated
    pub fn overwrite_headers(&self) -> bool {
        !self.config.caching
    }
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolbox")
            .field("working_dir", &self.working_dir())
            .field("caching", &self.config.caching)
            .finish()
    }
}

/// Directory for a component's outputs: `output_dir` when given, else the
/// directory of `base`
pub(crate) fn output_dir_for(base: &Path, output_dir: Option<&Path>) -> PathBuf {
    match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => base.parent().map(Path::to_path_buf).unwrap_or_default(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for component tests

    use super::*;
    use crate::tools::mock::{MockToolbox, MockVolume};
    use tempfile::TempDir;

    pub fn toolbox(mock: &Arc<MockToolbox>, config: PipelineConfig, dir: &Path) -> Toolbox {
        Toolbox::new(mock.clone(), mock.clone(), config, dir)
    }

    /// Cube of intensity 100 at `origin` in an otherwise empty volume
    pub fn block(shape: [usize; 3], origin: [usize; 3], size: usize) -> MockVolume {
        MockVolume::from_fn(shape, [0.1, 0.1, 0.5], |x, y, z| {
            let inside = [x, y, z]
                .iter()
                .zip(origin.iter())
                .all(|(p, o)| *p >= *o && *p < *o + size);
            if inside {
                100.0
            } else {
                0.0
            }
        })
    }

    pub fn write(dir: &TempDir, name: &str, volume: &MockVolume) -> PathBuf {
        let path = dir.path().join(name);
        volume.write(&path).unwrap();
        path
    }
}
