use thiserror::Error;

use crate::domain::model::IterationRecord;

#[derive(Error, Debug)]
pub enum RfError {
    #[error("Invalid stack-up: {parameter} = {value} ({reason})")]
    InvalidStackup {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("Unachievable target: {parameter} = {value} ({reason})")]
    UnachievableTarget {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("{dimension} = {value_mm:.4} mm is below the manufacturing limit of {limit_mm:.4} mm")]
    BelowManufacturingLimit {
        dimension: String,
        value_mm: f64,
        limit_mm: f64,
    },

    #[error("Degenerate geometry: {reason}")]
    DegenerateGeometry { reason: String },

    #[error("Layer '{layer}' required by {required_by} is not present in the stack-up")]
    UnresolvedLayerReference { layer: String, required_by: String },

    #[error("Solver invocation failed: {message}")]
    SolverInvocationError { message: String, diagnostics: String },

    #[error("Incomplete solver result: {message}")]
    IncompleteResult { message: String, diagnostics: String },

    #[error("Synthesis of {parameter} did not converge after {iterations} iterations (last estimate {best_estimate:.6}, residual {residual:.6})")]
    ConvergenceFailure {
        parameter: String,
        iterations: usize,
        best_estimate: f64,
        residual: f64,
    },

    #[error("Feedback on {parameter} diverged after {iterations} iterations (errors grew twice in a row)")]
    FeedbackDivergence {
        parameter: String,
        iterations: usize,
        best: Option<Box<IterationRecord>>,
    },

    #[error("Feedback on {parameter} did not converge within {iterations} iterations")]
    FeedbackNotConverged {
        parameter: String,
        iterations: usize,
        best: Option<Box<IterationRecord>>,
    },

    /// A non-feedback failure in the middle of a feedback run. Category, exit code and
    /// diagnostics are those of `cause`.
    #[error("Design run stopped after {iterations} iterations: {cause}")]
    FeedbackInterrupted {
        iterations: usize,
        best: Option<Box<IterationRecord>>,
        #[source]
        cause: Box<RfError>,
    },

    #[error("Layout parse error at token {position}: {message}")]
    LayoutParseError { position: usize, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("Configuration error in {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration field: {field}")]
    MissingConfigError { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    Model,
    ExternalTool,
    Convergence,
    Configuration,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RfError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RfError::FeedbackInterrupted { cause, .. } => cause.category(),
            RfError::InvalidStackup { .. }
            | RfError::UnachievableTarget { .. }
            | RfError::BelowManufacturingLimit { .. } => ErrorCategory::Input,
            RfError::DegenerateGeometry { .. } | RfError::UnresolvedLayerReference { .. } => {
                ErrorCategory::Model
            }
            RfError::SolverInvocationError { .. } | RfError::IncompleteResult { .. } => {
                ErrorCategory::ExternalTool
            }
            RfError::ConvergenceFailure { .. }
            | RfError::FeedbackDivergence { .. }
            | RfError::FeedbackNotConverged { .. } => ErrorCategory::Convergence,
            RfError::ConfigValidationError { .. }
            | RfError::InvalidConfigValueError { .. }
            | RfError::MissingConfigError { .. }
            | RfError::LayoutParseError { .. } => ErrorCategory::Configuration,
            RfError::IoError(_)
            | RfError::SerializationError(_)
            | RfError::CsvError(_)
            | RfError::ZipError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Input | ErrorCategory::Configuration => ErrorSeverity::Medium,
            ErrorCategory::Convergence | ErrorCategory::ExternalTool => ErrorSeverity::High,
            ErrorCategory::Model | ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    /// Only external tool failures are retried, and only once, by the simulation driver.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::ExternalTool
    }

    /// Process exit status used by the command line tools.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Input => 2,
            ErrorCategory::Convergence => 4,
            ErrorCategory::Model | ErrorCategory::ExternalTool => 3,
            ErrorCategory::Configuration | ErrorCategory::System => 1,
        }
    }

    /// Raw solver output attached to external tool failures.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            RfError::FeedbackInterrupted { cause, .. } => cause.diagnostics(),
            RfError::SolverInvocationError { diagnostics, .. }
            | RfError::IncompleteResult { diagnostics, .. } => Some(diagnostics.as_str()),
            _ => None,
        }
    }

    /// Best iteration seen before a feedback loop gave up.
    pub fn best_iteration(&self) -> Option<&IterationRecord> {
        match self {
            RfError::FeedbackDivergence { best, .. }
            | RfError::FeedbackNotConverged { best, .. }
            | RfError::FeedbackInterrupted { best, .. } => best.as_deref(),
            _ => None,
        }
    }

    /// The underlying failure, looking through `FeedbackInterrupted`.
    pub fn root_cause(&self) -> &RfError {
        match self {
            RfError::FeedbackInterrupted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            RfError::FeedbackInterrupted { cause, .. } => cause.recovery_suggestion(),
            RfError::InvalidStackup { parameter, .. } => format!(
                "Check '{}' in the stack-up: thicknesses must be positive and permittivity at least 1",
                parameter
            ),
            RfError::UnachievableTarget { parameter, .. } => format!(
                "Adjust '{}' or choose a substrate that supports it",
                parameter
            ),
            RfError::BelowManufacturingLimit { dimension, .. } => format!(
                "Use a thinner substrate or a higher target impedance so that '{}' grows",
                dimension
            ),
            RfError::DegenerateGeometry { .. } | RfError::UnresolvedLayerReference { .. } => {
                "This is an internal consistency failure; report it with the logged board state"
                    .to_string()
            }
            RfError::SolverInvocationError { .. } => {
                "Check the solver executable, its licence and the configured timeout".to_string()
            }
            RfError::IncompleteResult { .. } => {
                "Inspect the solver output directory for missing frequency samples or ports"
                    .to_string()
            }
            RfError::ConvergenceFailure { parameter, .. } => format!(
                "Raise synthesis.max_iterations or loosen the tolerance for '{}'",
                parameter
            ),
            RfError::FeedbackDivergence { .. } => {
                "The closed-form model does not track the solver here; start from the best iteration and tune manually"
                    .to_string()
            }
            RfError::FeedbackNotConverged { .. } => {
                "Raise feedback.max_iterations or loosen feedback tolerances".to_string()
            }
            RfError::LayoutParseError { .. } => {
                "Make sure the layout file was written by a compatible tool".to_string()
            }
            RfError::ConfigValidationError { field, .. }
            | RfError::InvalidConfigValueError { field, .. }
            | RfError::MissingConfigError { field } => {
                format!("Fix the '{}' entry in the configuration", field)
            }
            RfError::IoError(_) => "Check file paths and permissions".to_string(),
            RfError::SerializationError(_) | RfError::CsvError(_) | RfError::ZipError(_) => {
                "Check the integrity of the generated artifacts".to_string()
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Input => format!("Input problem: {}", self),
            ErrorCategory::Model => format!("Internal model error: {}", self),
            ErrorCategory::ExternalTool => format!("Solver problem: {}", self),
            ErrorCategory::Convergence => format!("Design did not converge: {}", self),
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::System => format!("System error: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, RfError>;
