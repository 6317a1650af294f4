/// Typestate session driving a subject through the registration pipeline
///
/// Each state is a distinct type, so coregistering unvalidated inputs or
/// registering to a template before coregistration does not compile.
///
/// # States
///
/// - `Uninitialized` - Inputs named but not checked
/// - `InputsValidated` - Inputs exist, configuration and tools checked
/// - `Coregistered` - Anat warped onto CEST, anat to CEST transform known
/// - `TemplateRegistered` - Anat and CEST carried into template space
///
/// Transitions consume the session. A failed transition drops it; running
/// again means constructing a new session.
///
/// # Example
///
/// ```no_run
/// use cestreg::config::PipelineConfig;
/// use cestreg::session::{CestSession, SessionInputs};
///
/// let inputs = SessionInputs::new("anat.nii", "cest.nii", "out").subject("rat01");
/// let session = CestSession::local(inputs, PipelineConfig::default())
///     .validate()?
///     .coregister()?
///     .register_to_template("template.nii")?;
/// println!("{}", session.state.template_registration.registered_cest.display());
/// # Ok::<(), cestreg::error::CestError>(())
/// ```
pub mod states;
pub mod transitions;
pub mod wrapper;

pub use states::*;
pub use wrapper::*;

use crate::config::PipelineConfig;
use crate::registration::{AffineWarpRegistrar, TemplateRegistrar, Toolbox};
use crate::tools::{CacheStore, ProcessRunner, ToolRunner};
use crate::volume::{ImageReader, NiftiReader};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Registration session with type-safe state
pub struct CestSession<S> {
    /// Unique session identifier
    pub session_id: Uuid,

    /// Current state (type parameter ensures type safety)
    pub state: S,

    /// Session metadata (available in all states)
    pub metadata: SessionMetadata,

    toolbox: Toolbox,
    registrar: Arc<dyn TemplateRegistrar>,
}

/// Metadata available in all states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub subject_id: Option<String>,

    /// Raw anatomical volume
    pub anat: PathBuf,

    /// Raw CEST volume
    pub cest: PathBuf,

    /// Directory receiving every artifact of this session
    pub output_dir: PathBuf,

    pub created_at: DateTime<Utc>,
}

/// Input volumes and output location of a session
#[derive(Debug, Clone)]
pub struct SessionInputs {
    anat: PathBuf,
    cest: PathBuf,
    output_dir: PathBuf,
    subject_id: Option<String>,
}

impl SessionInputs {
    pub fn new(
        anat: impl Into<PathBuf>,
        cest: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            anat: anat.into(),
            cest: cest.into(),
            output_dir: output_dir.into(),
            subject_id: None,
        }
    }

    /// Place outputs in a per-subject subdirectory
    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Directory the session writes into
    pub fn resolved_output_dir(&self) -> PathBuf {
        match &self.subject_id {
            Some(subject) => self.output_dir.join(subject),
            None => self.output_dir.clone(),
        }
    }

    fn into_metadata(self) -> SessionMetadata {
        let output_dir = self.resolved_output_dir();
        SessionMetadata {
            subject_id: self.subject_id,
            anat: self.anat,
            cest: self.cest,
            output_dir,
            created_at: Utc::now(),
        }
    }
}

impl<S> CestSession<S> {
    /// Get the session ID
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Get session metadata
    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn output_dir(&self) -> &Path {
        &self.metadata.output_dir
    }

    pub fn config(&self) -> &PipelineConfig {
        self.toolbox.config()
    }

    /// Replace the cache backend used when caching is enabled
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.toolbox = self.toolbox.with_cache(cache);
        self
    }

    /// Replace the anat to template registration collaborator
    pub fn with_registrar(mut self, registrar: Arc<dyn TemplateRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    /// Carry session identity over to a new state
    fn advance<T>(self, state: T) -> CestSession<T> {
        CestSession {
            session_id: self.session_id,
            state,
            metadata: self.metadata,
            toolbox: self.toolbox,
            registrar: self.registrar,
        }
    }
}

impl CestSession<Uninitialized> {
    /// Create a session whose tools run through `runner` and whose volumes
    /// are inspected through `reader`
    pub fn new(
        inputs: SessionInputs,
        config: PipelineConfig,
        runner: Arc<dyn ToolRunner>,
        reader: Arc<dyn ImageReader>,
    ) -> Self {
        let metadata = inputs.into_metadata();
        let toolbox = Toolbox::new(runner, reader, config, &metadata.output_dir);
        Self {
            session_id: Uuid::new_v4(),
            state: Uninitialized,
            metadata,
            toolbox,
            registrar: Arc::new(AffineWarpRegistrar),
        }
    }

    /// Session running the installed programs on NIfTI volumes
    pub fn local(inputs: SessionInputs, config: PipelineConfig) -> Self {
        Self::new(
            inputs,
            config,
            Arc::new(ProcessRunner::new()),
            Arc::new(NiftiReader::new()),
        )
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for CestSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CestSession")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("metadata", &self.metadata)
            .field("toolbox", &self.toolbox)
            .finish()
    }
}
