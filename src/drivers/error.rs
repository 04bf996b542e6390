use std::io;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("no connection to the instrument")]
    NotConnected,
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for the instrument")]
    Timeout,
    #[error("retry of `{command}` failed: {source}")]
    RetryFailed {
        command: String,
        #[source]
        source: Box<InstrumentError>,
    },
    #[error("connection closed by the instrument")]
    Closed,
    #[error("unknown measurement kind `{0}`")]
    UnknownMeasurement(String),
    #[error("invalid endpoint `{0}`, expected host:port")]
    InvalidEndpoint(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
impl InstrumentError {
    /// Timeouts are the only failure worth resending a query for.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InstrumentError::Timeout)
    }
}
