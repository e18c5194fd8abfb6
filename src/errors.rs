use std::fmt;

/// Pipeline-level error types.
///
/// Record-level and fetch-level failures are recovered locally through the
/// fallback chains; only `Configuration` (and I/O on the input/output files)
/// stops a run.
#[derive(Debug)]
pub enum PipelineError {
    /// A single record failed validation.
    Validation(ValidationError),
    /// An external source returned a value outside plausible bounds.
    DataIntegrity(String),
    /// Network/timeout failure after retries were exhausted.
    TransientFetch(String),
    /// Invalid settings at startup. Fatal.
    Configuration(String),
    /// Reading the input or writing the output failed.
    Io(String),
    /// The tabular input/output could not be parsed or written.
    Csv(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<PipelineError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Validation(e) => write!(f, "Validation error: {}", e),
            PipelineError::DataIntegrity(msg) => write!(f, "Data integrity error: {}", msg),
            PipelineError::TransientFetch(msg) => write!(f, "Transient fetch error: {}", msg),
            PipelineError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::Io(msg) => write!(f, "I/O error: {}", msg),
            PipelineError::Csv(msg) => write!(f, "CSV error: {}", msg),
            PipelineError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    /// Only configuration problems abort a run before it starts.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Configuration(_) | PipelineError::Io(_) | PipelineError::Csv(_) => true,
            PipelineError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Csv(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Configuration(format!("invalid JSON: {}", err))
    }
}

impl From<ValidationError> for PipelineError {
    fn from(err: ValidationError) -> Self {
        PipelineError::Validation(err)
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::DataIntegrity(msg) => PipelineError::DataIntegrity(msg),
            other => PipelineError::TransientFetch(other.to_string()),
        }
    }
}

/// Per-field refinery failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Identifier is not 10 digits or its checksum digit does not match.
    InvalidTaxId(String),
    /// Phone present but not normalizable to the canonical form.
    InvalidPhone(String),
    /// Phone required but absent.
    MissingPhone,
    /// Email required but absent or invalid.
    MissingEmail,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidTaxId(raw) => write!(f, "invalid tax identifier '{}'", raw),
            ValidationError::InvalidPhone(raw) => write!(f, "invalid phone '{}'", raw),
            ValidationError::MissingPhone => write!(f, "missing phone"),
            ValidationError::MissingEmail => write!(f, "missing email"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Typed failure of a gateway call. A failed fetch never comes back as a
/// zero-filled payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network error, timeout or 5xx/429 response.
    Transient(String),
    /// 4xx-equivalent semantic error. Not retried.
    Semantic { status: u16, message: String },
    /// Value outside plausible bounds.
    DataIntegrity(String),
    /// Body could not be decoded.
    Decode(String),
    /// Circuit breaker is open for this gateway.
    CircuitOpen(String),
    /// Gateway is not configured for this run.
    Disabled(String),
}

impl FetchError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transient(msg) => write!(f, "transient failure: {}", msg),
            FetchError::Semantic { status, message } => {
                write!(f, "request rejected with {}: {}", status, message)
            }
            FetchError::DataIntegrity(msg) => write!(f, "implausible data: {}", msg),
            FetchError::Decode(msg) => write!(f, "decode failure: {}", msg),
            FetchError::CircuitOpen(name) => write!(f, "circuit open for {}", name),
            FetchError::Disabled(name) => write!(f, "{} gateway disabled", name),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return FetchError::Decode(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                FetchError::Semantic {
                    status: status.as_u16(),
                    message: err.to_string(),
                }
            }
            _ => FetchError::Transient(err.to_string()),
        }
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `PipelineError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, PipelineError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<PipelineError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError::WithContext {
            source: Box::new(e.into()),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipelineError::WithContext {
            source: Box::new(e.into()),
            context: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain_display() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        let err = result.context("opening input leads.csv").unwrap_err();
        assert_eq!(
            err.to_string(),
            "opening input leads.csv: I/O error: no such file"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_only_transient_fetch_errors_retry() {
        assert!(FetchError::Transient("timeout".into()).is_retryable());
        assert!(!FetchError::Semantic {
            status: 404,
            message: "gone".into()
        }
        .is_retryable());
        assert!(!FetchError::DataIntegrity("count 0".into()).is_retryable());
    }

    #[test]
    fn test_fetch_error_maps_into_taxonomy() {
        let integrity: PipelineError = FetchError::DataIntegrity("too many".into()).into();
        assert!(matches!(integrity, PipelineError::DataIntegrity(_)));
        assert!(!integrity.is_fatal());

        let transient: PipelineError = FetchError::Transient("reset".into()).into();
        assert!(matches!(transient, PipelineError::TransientFetch(_)));
    }
}
