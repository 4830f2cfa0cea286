use thiserror::Error;

/// Every failure a generation cycle can surface to the user.
/// All variants carry enough context for a single user-visible notification;
/// none of them are retried automatically.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Input errors ─────────────────────────────────────────────────────────
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("A generation is already in progress for this session")]
    AlreadyInProgress,

    // ── Provider errors ──────────────────────────────────────────────────────
    #[error("Missing credentials for {provider}")]
    MissingCredentials { provider: String },

    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    #[error("Provider error ({status}): {message}")]
    ProviderError { status: u16, message: String },

    #[error("Provider returned an empty result")]
    EmptyResult,

    #[error("Timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    // ── Extraction errors ────────────────────────────────────────────────────
    #[error("No viable document in model output ({length} bytes, need at least {minimum})")]
    ExtractionError { length: usize, minimum: usize },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        AppError::InvalidInput { message: message.into() }
    }

    pub fn missing_credentials(provider: impl Into<String>) -> Self {
        AppError::MissingCredentials { provider: provider.into() }
    }

    pub fn connection(message: impl std::fmt::Display) -> Self {
        AppError::ConnectionError { message: message.to_string() }
    }

    /// Provider failure that happened mid-stream, after a 2xx status.
    pub fn stream(message: impl std::fmt::Display) -> Self {
        AppError::ProviderError { status: 200, message: message.to_string() }
    }

    /// Stable tag used on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidInput { .. } => "invalid_input",
            AppError::AlreadyInProgress => "already_in_progress",
            AppError::MissingCredentials { .. } => "missing_credentials",
            AppError::ConnectionError { .. } => "connection_error",
            AppError::ProviderError { .. } => "provider_error",
            AppError::EmptyResult => "empty_result",
            AppError::Timeout { .. } => "timeout",
            AppError::ExtractionError { .. } => "extraction_error",
            AppError::Unexpected(_) => "unexpected",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::InvalidInput { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::AlreadyInProgress)
    }

    pub fn is_provider_unavailable(&self) -> bool {
        matches!(self, AppError::MissingCredentials { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout { .. })
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => AppError::ProviderError {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => AppError::connection(e),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::connection(e)
    }
}
