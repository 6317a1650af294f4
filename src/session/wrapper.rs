/// Type-erased wrapper for CestSession<S>
///
/// Holds a session in any state behind one type, for callers that decide
/// the next step at runtime. Calls made in the wrong state fail with
/// `InvalidState` naming the stage.
use super::states::*;
use super::CestSession;
use crate::error::{CestError, CestResult};
use crate::registration::TemplateOptions;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Wrapper enum that can hold CestSession in any state
#[derive(Debug)]
pub enum CestSessionState {
    Uninitialized(CestSession<Uninitialized>),
    InputsValidated(CestSession<InputsValidated>),
    Coregistered(CestSession<Coregistered>),
    TemplateRegistered(CestSession<TemplateRegistered>),
}

impl From<CestSession<Uninitialized>> for CestSessionState {
    fn from(session: CestSession<Uninitialized>) -> Self {
        Self::Uninitialized(session)
    }
}

impl CestSessionState {
    /// Get the session ID
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::Uninitialized(s) => s.session_id(),
            Self::InputsValidated(s) => s.session_id(),
            Self::Coregistered(s) => s.session_id(),
            Self::TemplateRegistered(s) => s.session_id(),
        }
    }

    /// Get the current state as a string
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Uninitialized(_) => "Uninitialized",
            Self::InputsValidated(_) => "InputsValidated",
            Self::Coregistered(_) => "Coregistered",
            Self::TemplateRegistered(_) => "TemplateRegistered",
        }
    }

    /// Validate inputs (only from Uninitialized)
    pub fn validate(self) -> CestResult<Self> {
        match self {
            Self::Uninitialized(session) => Ok(Self::InputsValidated(session.validate()?)),
            _ => Err(CestError::InvalidState(format!(
                "input validation attempted in {} state",
                self.state_name()
            ))),
        }
    }

    /// Coregister anat onto CEST (only from InputsValidated)
    pub fn coregister(self) -> CestResult<Self> {
        match self {
            Self::InputsValidated(session) => Ok(Self::Coregistered(session.coregister()?)),
            Self::Uninitialized(_) => Err(CestError::InvalidState(
                "coregistration attempted before input validation".to_string(),
            )),
            _ => Err(CestError::InvalidState(format!(
                "coregistration already performed ({} state); start a new session to rerun it",
                self.state_name()
            ))),
        }
    }

    /// Register to `template` (only from Coregistered)
    pub fn register_to_template(self, template: impl Into<PathBuf>) -> CestResult<Self> {
        self.register_to_template_with(template, TemplateOptions::default())
    }

    /// Register to `template` with extra options (only from Coregistered)
    pub fn register_to_template_with(
        self,
        template: impl Into<PathBuf>,
        options: TemplateOptions,
    ) -> CestResult<Self> {
        match self {
            Self::Coregistered(session) => Ok(Self::TemplateRegistered(
                session.register_to_template_with(template, options)?,
            )),
            Self::TemplateRegistered(_) => Err(CestError::InvalidState(
                "registration to template already performed; start a new session to rerun it"
                    .to_string(),
            )),
            _ => Err(CestError::InvalidState(
                "registration to template attempted before coregistration".to_string(),
            )),
        }
    }

    /// Coregistration outputs if available
    pub fn coregistration(&self) -> Option<&Coregistration> {
        match self {
            Self::Coregistered(s) => Some(&s.state.coregistration),
            Self::TemplateRegistered(s) => Some(&s.state.coregistration),
            _ => None,
        }
    }

    /// Template registration outputs if available
    pub fn template_registration(&self) -> Option<&TemplateRegistration> {
        match self {
            Self::TemplateRegistered(s) => Some(&s.state.template_registration),
            _ => None,
        }
    }

    /// Look up a produced artifact by role.
    ///
    /// Roles: `coreg_anat`, `coreg_transform`, `template`,
    /// `registered_anat`, `registered_cest`.
    pub fn artifact(&self, role: &str) -> Option<&Path> {
        match role {
            "coreg_anat" => self.coregistration().map(|c| c.coreg_anat.as_path()),
            "coreg_transform" => self.coregistration().map(|c| c.coreg_transform.path()),
            "template" => self.template_registration().map(|t| t.template.as_path()),
            "registered_anat" => self
                .template_registration()
                .map(|t| t.registered_anat.as_path()),
            "registered_cest" => self
                .template_registration()
                .map(|t| t.registered_cest.as_path()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::*;
    use crate::config::PipelineConfig;

    fn state(fixture: &Fixture) -> CestSessionState {
        fixture.session(PipelineConfig::default()).into()
    }

    #[test]
    fn test_new_session() {
        let fixture = Fixture::new();
        let session = state(&fixture);
        assert_eq!(session.state_name(), "Uninitialized");
        assert!(session.coregistration().is_none());
        assert!(session.artifact("coreg_anat").is_none());
    }

    #[test]
    fn test_template_before_coregistration() {
        let fixture = Fixture::new();
        let template = fixture.template();

        let err = state(&fixture).register_to_template(&template).unwrap_err();
        assert!(matches!(err, CestError::InvalidState(_)));
        assert!(err
            .to_string()
            .contains("registration to template attempted before coregistration"));

        let validated = state(&fixture).validate().unwrap();
        let err = validated.register_to_template(&template).unwrap_err();
        assert!(matches!(err, CestError::InvalidState(_)));
        assert!(fixture.mock.calls().is_empty());
    }

    #[test]
    fn test_coregister_before_validation() {
        let fixture = Fixture::new();
        let err = state(&fixture).coregister().unwrap_err();
        assert!(matches!(err, CestError::InvalidState(_)));
    }

    #[test]
    fn test_repeated_coregistration_is_rejected() {
        let fixture = Fixture::new();
        let session = state(&fixture).validate().unwrap().coregister().unwrap();
        assert_eq!(session.state_name(), "Coregistered");
        let runs = fixture.mock.count("3dWarp");

        let err = session.coregister().unwrap_err();
        assert!(matches!(err, CestError::InvalidState(_)));
        assert_eq!(fixture.mock.count("3dWarp"), runs);
    }

    #[test]
    fn test_full_run_exposes_artifacts() {
        let fixture = Fixture::new();
        let template = fixture.template();
        let session = state(&fixture)
            .validate()
            .unwrap()
            .coregister()
            .unwrap()
            .register_to_template(&template)
            .unwrap();

        assert_eq!(session.state_name(), "TemplateRegistered");
        assert_eq!(session.artifact("template"), Some(template.as_path()));
        for role in ["coreg_anat", "coreg_transform", "registered_anat", "registered_cest"] {
            assert!(session.artifact(role).unwrap().exists(), "{} missing", role);
        }
        assert!(session.artifact("unknown").is_none());

        let err = session.register_to_template(&template).unwrap_err();
        assert!(matches!(err, CestError::InvalidState(_)));
    }
}
