use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    /// Malformed or empty input table.
    #[error("Data error: {0}")]
    Data(String),

    /// The refine pass produced no usable contamination candidate.
    #[error("Contamination computation error: {message}")]
    ContaminationComputation {
        message: String,
        #[source]
        source: Option<Box<FilterError>>,
    },

    /// The surrogate model attributes nothing to any feature.
    #[error("Degenerate model: {0}")]
    DegenerateModel(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Batch process is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FilterError {
    pub fn contamination(message: impl Into<String>) -> Self {
        FilterError::ContaminationComputation {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap `cause` unless it already is a contamination error.
    pub fn contamination_from(cause: FilterError) -> Self {
        match cause {
            err @ FilterError::ContaminationComputation { .. } => err,
            other => FilterError::ContaminationComputation {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

impl From<csv::Error> for FilterError {
    fn from(err: csv::Error) -> Self {
        FilterError::Decode(err.to_string())
    }
}

impl From<calamine::XlsxError> for FilterError {
    fn from(err: calamine::XlsxError) -> Self {
        FilterError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
