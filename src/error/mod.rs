use thiserror::Error;

/// Errors raised by the simulation engine.
///
/// Structural errors (model, composition, scenario) abort a run before any
/// task is dispatched. [`PbpkError::IntegrationDivergedError`] is scoped to a
/// single task and is recorded in place by the scan orchestrator.
#[derive(Error, Debug)]
pub enum PbpkError {
    /// The model source is not well-formed
    #[error("Failed to parse model '{source_name}': {message}")]
    ModelParseError {
        source_name: String,
        message: String,
    },

    /// The model is well-formed but references undefined symbols, mixes
    /// incompatible units or leaves a state without a rate equation
    #[error("Invalid model '{model}': {message}")]
    ModelValidationError { model: String, message: String },

    /// Two submodels cannot be merged on a shared symbol
    #[error("Cannot compose submodels on '{symbol}': {message}")]
    CompositionConflictError { symbol: String, message: String },

    /// The scenario references something the model does not define
    #[error("Invalid scenario '{scenario}': {message}")]
    ScenarioError { scenario: String, message: String },

    /// The solver could not advance a task within tolerances or budget
    #[error("Integration diverged at t = {time}: {reason}")]
    IntegrationDivergedError { time: f64, reason: String },

    /// A run-level cancellation was observed
    #[error("Cancellation requested")]
    CancellationRequested,

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start worker pool: {0}")]
    ThreadPool(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PbpkError {
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModelParseError {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn validation(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModelValidationError {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn conflict(symbol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CompositionConflictError {
            symbol: symbol.into(),
            message: message.into(),
        }
    }

    pub fn scenario(scenario: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScenarioError {
            scenario: scenario.into(),
            message: message.into(),
        }
    }

    pub fn diverged(time: f64, reason: impl Into<String>) -> Self {
        Self::IntegrationDivergedError {
            time,
            reason: reason.into(),
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Whether the error is confined to a single task
    pub fn is_task_local(&self) -> bool {
        matches!(
            self,
            Self::IntegrationDivergedError { .. } | Self::CancellationRequested
        )
    }
}
