use thiserror::Error;

use crate::observation::BestPoint;

/// Main error type for the Trellis system
#[derive(Error, Debug)]
pub enum TrellisError {
    #[error("Invalid parameterization: {message}")]
    InvalidParameterization { message: String },

    #[error("Invalid state transition for trial {trial_index}: cannot {action} a {from} trial")]
    InvalidStateTransition {
        trial_index: usize,
        from: String,
        action: &'static str,
    },

    #[error("Trial not found: {trial_index}")]
    TrialNotFound { trial_index: usize },

    #[error("Duplicate parameter name: {name}")]
    DuplicateParameterName { name: String },

    #[error("Invalid bounds for parameter {name}: {message}")]
    InvalidBounds { name: String, message: String },

    #[error("No completed trials")]
    NoCompletedTrials,

    #[error("Generation stalled: no proposal after {attempts} polls with nothing in flight")]
    GenerationStalled { attempts: usize },

    #[error(
        "Run aborted: {failed} of {finished} finished trials failed \
         (rate {failure_rate:.2} exceeds {max_failure_rate:.2})"
    )]
    RunAborted {
        failed: usize,
        finished: usize,
        failure_rate: f64,
        max_failure_rate: f64,
        best_so_far: Option<Box<BestPoint>>,
    },

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerFailure),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a single trial evaluation did not produce an observation.
///
/// Worker failures are recorded against the trial and never abort a run on
/// their own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerFailure {
    #[error("evaluation failed: {message}")]
    Evaluation { message: String },

    #[error("evaluation timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },

    #[error("worker panicked: {message}")]
    Panicked { message: String },

    #[error("worker cancelled")]
    Cancelled,

    #[error("objective {name} missing from evaluation result")]
    MissingObjective { name: String },
}

impl WorkerFailure {
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }
}

/// Result type alias for Trellis operations
pub type TrellisResult<T> = Result<T, TrellisError>;

/// Macro for creating parameterization validation errors
#[macro_export]
macro_rules! invalid_parameterization {
    ($($arg:tt)*) => {
        $crate::TrellisError::InvalidParameterization { message: format!($($arg)*) }
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TrellisError::Config(format!($($arg)*))
    };
}
