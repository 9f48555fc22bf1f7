use thiserror::Error;

/// Failure of a single browser action or connection step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrowserError {
    /// The browser or the inspection server went away mid-action.
    #[error("browser disconnected: {0}")]
    Disconnected(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("script error: {0}")]
    Evaluation(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl BrowserError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BrowserError::Disconnected(_))
    }
}

impl From<BrowserError> for pilotdeck_core::Error {
    fn from(e: BrowserError) -> Self {
        match e {
            BrowserError::Timeout(msg) => pilotdeck_core::Error::Timeout(msg),
            other => pilotdeck_core::Error::Browser(other.to_string()),
        }
    }
}

pub type BrowserResult<T> = std::result::Result<T, BrowserError>;
