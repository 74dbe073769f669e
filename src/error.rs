use crate::parser::ParseError;
use std::io;

/// Central error type for the tallyd engine.
#[derive(Debug)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Error during HTTP request framing.
    Parse(ParseError),
    /// Bad or unreadable configuration.
    Config(String),
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Parse(e) => write!(f, "Parse error: {}", e),
            ServerError::Config(msg) => write!(f, "Config error: {}", msg),
            ServerError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<ParseError> for ServerError {
    fn from(e: ParseError) -> Self {
        ServerError::Parse(e)
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
