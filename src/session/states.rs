/// State type definitions for the registration session
///
/// State-specific results are stored in each state type and carried forward
/// by the transitions, so a state only holds fields that were actually
/// produced on the way to it.
use crate::pipeline::PipelineReport;
use crate::transform::Transform;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Initial state: inputs named, nothing checked
#[derive(Debug, Clone, Default)]
pub struct Uninitialized;

/// Inputs exist, configuration and required programs checked
#[derive(Debug, Clone)]
pub struct InputsValidated {
    pub validated_at: DateTime<Utc>,
}

/// Anat brought onto the CEST volume
#[derive(Debug, Clone)]
pub struct Coregistered {
    pub coregistration: Coregistration,
}

/// Anat and CEST brought into template space
#[derive(Debug, Clone)]
pub struct TemplateRegistered {
    pub coregistration: Coregistration,
    pub template_registration: TemplateRegistration,
}

/// Outputs of coregistration
#[derive(Debug, Clone, PartialEq)]
pub struct Coregistration {
    /// Anat warped onto the CEST grid
    pub coreg_anat: PathBuf,

    /// One-line affine from the raw anat to the raw CEST volume
    pub coreg_transform: Transform,

    /// Per-slice warps, `None` for skipped slices; absent unless the
    /// per-slice refinement ran
    pub slice_transforms: Option<Vec<Option<PathBuf>>>,

    pub report: PipelineReport,
}

/// Outputs of template registration
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRegistration {
    pub template: PathBuf,
    pub registered_anat: PathBuf,
    pub pre_transform: Transform,
    pub transform: Transform,
    pub registered_cest: PathBuf,
    pub report: PipelineReport,
}

impl InputsValidated {
    pub fn new() -> Self {
        Self {
            validated_at: Utc::now(),
        }
    }
}

impl Default for InputsValidated {
    fn default() -> Self {
        Self::new()
    }
}
