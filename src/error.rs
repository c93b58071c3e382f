use thiserror::Error;

/// Process-level error: a message plus the exit code the binary returns.
#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

/// Errors raised by the fitting library.
///
/// Every variant here is fatal for the run it occurs in. Per-pair problems
/// (too few usable filters, a model older than the universe) never surface
/// as errors; they are recorded as sentinel chi-square values instead.
#[derive(Error, Debug)]
pub enum FitError {
    /// Array sizes disagree (flux vs. inverse variance, ids, redshifts, filters).
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Non-finite flux or inverse variance, negative inverse variance, or a
    /// non-positive redshift.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Redshift outside the model grid, or a grid that is not strictly increasing.
    #[error("redshift grid error: {0}")]
    GridBounds(String),

    /// Refusing to overwrite an existing output file.
    #[error("output already exists: {0} (pass --overwrite to replace it)")]
    OutputExists(String),

    /// A model chunk could not be read or decoded.
    #[error("model grid error: {0}")]
    Grid(String),

    /// Invalid fit parameter.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FitError {
    /// Exit code used when this error terminates the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            FitError::Config(_) | FitError::Io(_) => 2,
            FitError::ShapeMismatch(_) | FitError::InvalidValue(_) => 3,
            FitError::GridBounds(_) | FitError::Grid(_) => 4,
            FitError::OutputExists(_) => 5,
            FitError::Cancelled => 6,
        }
    }
}

impl From<FitError> for AppError {
    fn from(err: FitError) -> Self {
        AppError::new(err.exit_code(), err.to_string())
    }
}
