use thiserror::Error;

/// A result type for GP force-field regression
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when building, training or querying a [`GaussianProcess`](crate::GaussianProcess) model
#[derive(Error, Debug)]
pub enum GpError {
    /// When the hyperparameter mask or model configuration is inconsistent
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// When linear algebra computation fails (e.g. covariance not positive-definite)
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When likelihood computation fails
    #[error("Likelihood computation error: {0}")]
    LikelihoodComputationError(String),
    /// When prediction is attempted with factors out of sync with the training set
    #[error("Stale factors error: {0}")]
    StaleFactorsError(String),
    /// When no optimization strategy could be executed
    #[error("Optimization error: {0}")]
    OptimizationError(String),
    /// When the worker pool cannot be built
    #[error("Worker pool error: {0}")]
    ThreadPoolError(String),
    /// When persistence is requested in an unrecognized format
    #[error("Unsupported format \"{0}\", supported formats are: json, bin")]
    UnsupportedFormatError(String),
    /// When JSON (de)serialization fails
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    /// When binary (de)serialization fails
    #[error("Binary codec error: {0}")]
    BincodeError(#[from] bincode::Error),
    /// When file IO fails during save or load
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// When an invalid value is encountered
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
