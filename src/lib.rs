//! Registration of rodent anatomical MRI and CEST volumes
//!
//! Orchestrates external neuroimaging programs to bring an anatomical
//! volume onto a CEST volume (coregistration), and both into a shared
//! template space. The crate derives artifact names, issues tool calls,
//! propagates oblique headers, composes transforms and cleans up
//! intermediates; the numerical work stays in the external programs.
//!
//! Entry point is [`session::CestSession`].

pub mod artifacts;
pub mod config;
pub mod error;
pub mod logger;
pub mod paths;
pub mod pipeline;
pub mod registration;
pub mod session;
pub mod tools;
pub mod transform;
pub mod volume;

pub use config::{MaskStrategy, PipelineConfig, WarpMode};
pub use error::{CestError, CestResult};
pub use registration::TemplateOptions;
pub use session::{CestSession, CestSessionState, SessionInputs};
pub use transform::{Transform, TransformChain};
