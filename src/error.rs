use thiserror::Error;

/// Central error type for the registration pipeline
#[derive(Error, Debug)]
pub enum CestError {
    // ============================================================================
    // Input / Session Errors
    // ============================================================================
    #[error("Missing input file: {0}")]
    MissingInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ============================================================================
    // External Tool Errors
    // ============================================================================
    #[error("Tool not available: {0}")]
    ToolUnavailable(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool '{tool}' timed out after {seconds} s")]
    ToolTimedOut { tool: String, seconds: u64 },

    // ============================================================================
    // Geometry / Transform Errors
    // ============================================================================
    #[error("Failed to fix obliquity header: {0}")]
    HeaderFix(String),

    #[error("Invalid transform chain: {0}")]
    TransformChain(String),

    #[error("Failed to read image: {0}")]
    ImageRead(String),

    // ============================================================================
    // File System Errors
    // ============================================================================
    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error("Cache error: {0}")]
    Cache(String),

    // ============================================================================
    // Generic/System Errors
    // ============================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pipeline error: {0}")]
    PipelineError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    GenericError(String),
}

impl CestError {
    /// Shorthand for a failed tool run
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        CestError::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

// Automatic conversion from String (for ad-hoc messages)
impl From<String> for CestError {
    fn from(err: String) -> Self {
        CestError::GenericError(err)
    }
}

impl From<&str> for CestError {
    fn from(err: &str) -> Self {
        CestError::GenericError(err.to_string())
    }
}

// Helper type alias for Results
pub type CestResult<T> = Result<T, CestError>;
