//! Immutable per-call pipeline settings
//!
//! A `PipelineConfig` is built once (directly, through the builder, or from a
//! JSON file) and then only ever borrowed by the stages. Nothing in the crate
//! mutates a config after construction; environment overrides in particular
//! are copied into each tool call instead of being shared.

use crate::error::{CestError, CestResult};
use crate::tools::ToolRunner;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable making AFNI programs overwrite existing outputs
pub const AFNI_DECONFLICT: &str = "AFNI_DECONFLICT";

/// Brain mask computation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskStrategy {
    /// Mathematical morphology (requires the RATS tools)
    Morphological,
    /// Intensity histogram based segmentation
    Histogram,
}

/// How whole-volume coregistration warps anat onto the functional volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarpMode {
    WholeVolume,
    PerSlice,
}

/// Tool output verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Forward tool stdout/stderr into the log
    Verbose,
    /// Discard tool output
    Quiet,
}

/// Names of the external programs driven by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCatalog {
    pub copy: String,
    pub unifize: String,
    pub clip_level: String,
    pub morpho_mask: String,
    pub histogram_mask: String,
    pub calc: String,
    pub allineate: String,
    pub cat_matvec: String,
    pub warp: String,
    pub refit: String,
    pub zcutup: String,
    pub resample: String,
    pub qwarp: String,
    pub zcat: String,
    pub nwarp_apply: String,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self {
            copy: "3dcopy".to_string(),
            unifize: "3dUnifize".to_string(),
            clip_level: "3dClipLevel".to_string(),
            morpho_mask: "RATS_MM".to_string(),
            histogram_mask: "HistogramMask".to_string(),
            calc: "3dcalc".to_string(),
            allineate: "3dAllineate".to_string(),
            cat_matvec: "cat_matvec".to_string(),
            warp: "3dWarp".to_string(),
            refit: "3drefit".to_string(),
            zcutup: "3dZcutup".to_string(),
            resample: "3dresample".to_string(),
            qwarp: "3dQwarp".to_string(),
            zcat: "3dZcat".to_string(),
            nwarp_apply: "3dNwarpApply".to_string(),
        }
    }
}

impl ToolCatalog {
    /// Program computing brain masks for the given strategy
    pub fn mask_program(&self, strategy: MaskStrategy) -> &str {
        match strategy {
            MaskStrategy::Morphological => &self.morpho_mask,
            MaskStrategy::Histogram => &self.histogram_mask,
        }
    }
}

/// Settings shared by every stage of one pipeline call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Expected brain volume in mm3 (typically 400 for mouse, 1650 for rat)
    pub brain_volume: u32,
    pub mask_strategy: MaskStrategy,
    /// Bias-correct heads before computing the brain mask
    pub bias_correct: bool,
    pub caching: bool,
    pub verbosity: Verbosity,
    pub environ: BTreeMap<String, String>,
    pub prior_rigid_registration: bool,
    pub warp_mode: WarpMode,
    /// In-plane voxel size used while warping single slices
    pub slice_voxel_size: (f64, f64),
    /// Voxel size of the template-registered functional volume
    pub template_voxel_size: Option<(f64, f64, f64)>,
    pub tool_timeout_secs: Option<u64>,
    pub slice_workers: usize,
    #[serde(default)]
    pub tools: ToolCatalog,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut environ = BTreeMap::new();
        environ.insert(AFNI_DECONFLICT.to_string(), "OVERWRITE".to_string());
        Self {
            brain_volume: 400,
            mask_strategy: MaskStrategy::Morphological,
            bias_correct: true,
            caching: false,
            verbosity: Verbosity::Verbose,
            environ,
            prior_rigid_registration: false,
            warp_mode: WarpMode::WholeVolume,
            slice_voxel_size: (0.1, 0.1),
            template_voxel_size: None,
            tool_timeout_secs: None,
            slice_workers: 1,
            tools: ToolCatalog::default(),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }

    /// Load settings from a JSON file
    pub fn from_json_file(path: &Path) -> CestResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist settings as pretty JSON
    pub fn to_json_file(&self, path: &Path) -> CestResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check field consistency
    pub fn validate(&self) -> CestResult<()> {
        if self.brain_volume == 0 {
            return Err(CestError::Config("brain_volume must be positive".to_string()));
        }
        let (vx, vy) = self.slice_voxel_size;
        if !(vx > 0.0 && vy > 0.0) {
            return Err(CestError::Config(format!(
                "slice voxel size must be positive, got ({}, {})",
                vx, vy
            )));
        }
        if let Some((x, y, z)) = self.template_voxel_size {
            if !(x > 0.0 && y > 0.0 && z > 0.0) {
                return Err(CestError::Config(format!(
                    "template voxel size must be positive, got ({}, {}, {})",
                    x, y, z
                )));
            }
        }
        if self.slice_workers == 0 {
            return Err(CestError::Config("slice_workers must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Probe the programs the selected strategies depend on.
    ///
    /// Runs before any processing so a missing segmentation tool fails the
    /// call immediately instead of midway through a pipeline.
    pub fn validate_tools(&self, runner: &dyn ToolRunner) -> CestResult<()> {
        if self.mask_strategy == MaskStrategy::Morphological
            && runner.locate(&self.tools.morpho_mask).is_none()
        {
            return Err(CestError::ToolUnavailable(format!(
                "can not locate {} required by the morphological mask strategy",
                self.tools.morpho_mask
            )));
        }
        Ok(())
    }
}

/// Fluent builder for `PipelineConfig`
#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    pub fn brain_volume(mut self, volume: u32) -> Self {
        self.config.brain_volume = volume;
        self
    }

    pub fn mask_strategy(mut self, strategy: MaskStrategy) -> Self {
        self.config.mask_strategy = strategy;
        self
    }

    pub fn bias_correct(mut self, enabled: bool) -> Self {
        self.config.bias_correct = enabled;
        self
    }

    pub fn caching(mut self, enabled: bool) -> Self {
        self.config.caching = enabled;
        self
    }

    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.config.verbosity = verbosity;
        self
    }

    /// Add or override one environment variable passed to every tool
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.environ.insert(key.into(), value.into());
        self
    }

    pub fn prior_rigid_registration(mut self, enabled: bool) -> Self {
        self.config.prior_rigid_registration = enabled;
        self
    }

    pub fn warp_mode(mut self, mode: WarpMode) -> Self {
        self.config.warp_mode = mode;
        self
    }

    pub fn slice_voxel_size(mut self, x: f64, y: f64) -> Self {
        self.config.slice_voxel_size = (x, y);
        self
    }

    pub fn template_voxel_size(mut self, x: f64, y: f64, z: f64) -> Self {
        self.config.template_voxel_size = Some((x, y, z));
        self
    }

    pub fn tool_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.tool_timeout_secs = Some(seconds);
        self
    }

    pub fn slice_workers(mut self, workers: usize) -> Self {
        self.config.slice_workers = workers;
        self
    }

    pub fn tools(mut self, tools: ToolCatalog) -> Self {
        self.config.tools = tools;
        self
    }

    /// Build the config
    ///
    /// # Errors
    /// Returns `CestError::Config` if a field is out of range
    pub fn build(self) -> CestResult<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_environ_overwrites() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.environ.get(AFNI_DECONFLICT).map(String::as_str),
            Some("OVERWRITE")
        );
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = PipelineConfig::builder()
            .brain_volume(1650)
            .mask_strategy(MaskStrategy::Histogram)
            .caching(true)
            .env("OMP_NUM_THREADS", "2")
            .slice_voxel_size(0.2, 0.2)
            .build()
            .unwrap();

        assert_eq!(config.brain_volume, 1650);
        assert_eq!(config.mask_strategy, MaskStrategy::Histogram);
        assert!(config.caching);
        assert_eq!(config.environ.len(), 2);
        assert_eq!(config.slice_voxel_size, (0.2, 0.2));
    }

    #[test]
    fn test_builder_rejects_bad_voxel_size() {
        let result = PipelineConfig::builder().slice_voxel_size(0.0, 0.1).build();
        assert!(matches!(result, Err(CestError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_zero_workers() {
        let result = PipelineConfig::builder().slice_workers(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = PipelineConfig::builder()
            .template_voxel_size(0.2, 0.2, 0.2)
            .warp_mode(WarpMode::PerSlice)
            .build()
            .unwrap();

        config.to_json_file(&path).unwrap();
        let loaded = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_mask_program_selection() {
        let tools = ToolCatalog::default();
        assert_eq!(tools.mask_program(MaskStrategy::Morphological), "RATS_MM");
        assert_eq!(tools.mask_program(MaskStrategy::Histogram), "HistogramMask");
    }
}
