//! Pipeline pattern implementation for sequential registration steps
//!
//! Each stage reads from and writes to a shared context, and the pipeline
//! handles error propagation, stage bookkeeping and logging. The stages that
//! make up coregistration and template registration live in [`stages`].
//!
//! # Example
//! ```
//! use cestreg::error::CestResult;
//! use cestreg::pipeline::{Pipeline, PipelineContext, PipelineStage};
//!
//! struct Label;
//!
//! impl PipelineStage for Label {
//!     fn execute(&self, context: &mut PipelineContext) -> CestResult<()> {
//!         let subject = context.get_string("subject")?;
//!         context.set_string("label", format!("{}_coreg", subject));
//!         Ok(())
//!     }
//!
//!     fn name(&self) -> &str {
//!         "Label"
//!     }
//! }
//!
//! let pipeline = Pipeline::builder("labels").add_stage(Label).build();
//!
//! let mut context = PipelineContext::new("session-123");
//! context.set_string("subject", "rat01");
//! let report = pipeline.execute(&mut context)?;
//! assert_eq!(report.executed_stages(), 1);
//! assert_eq!(context.get_string("label")?, "rat01_coreg");
//! # Ok::<(), cestreg::error::CestError>(())
//! ```

pub mod context;
pub mod core;
pub mod executor;
pub mod stages;

// Re-export main types
pub use context::PipelineContext;
pub use core::{PipelineReport, PipelineStage, StageResult};
pub use executor::{Pipeline, PipelineBuilder};
