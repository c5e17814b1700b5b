use crate::traits::ClientError;

/// Failures of a nettest state-machine operation.
#[derive(Debug, thiserror::Error)]
pub enum NettestError {
    #[error("report is already open")]
    ReportAlreadyOpen,

    #[error("report is not open")]
    ReportNotOpen,

    #[error("no suitable collectors found")]
    NoSuitableCollector,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Why a run ended before completing.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{0}")]
    Settings(String),

    #[error("unknown nettest name: {0}")]
    UnknownNettest(String),

    #[error("invalid {role} address: {url}")]
    InvalidAddress { role: &'static str, url: String },

    #[error("bouncer: {0}")]
    Bouncer(NettestError),

    #[error("cannot open report: {0}")]
    ReportCreate(NettestError),

    #[error("cannot serialize measurement: {0}")]
    Serialization(String),

    #[error("cannot start worker: {0}")]
    Worker(String),

    #[error("interrupted")]
    Interrupted,

    #[error("internal error: {0}")]
    Panic(String),
}

impl RunError {
    /// The `failure` reported by `status.end`.
    pub fn end_failure(&self) -> &'static str {
        match self {
            RunError::Settings(_)
            | RunError::UnknownNettest(_)
            | RunError::InvalidAddress { .. } => "value_error",
            RunError::Bouncer(_)
            | RunError::ReportCreate(_)
            | RunError::Serialization(_)
            | RunError::Worker(_)
            | RunError::Interrupted
            | RunError::Panic(_) => "generic_error",
        }
    }
}
