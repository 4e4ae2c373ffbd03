use std::fmt::{self, Display};
use std::io;

/// Errors raised while configuring or driving a simulation. Configuration problems are reported
/// at initialization; violated runtime invariants panic instead.
#[derive(Debug)]
pub enum EpiError {
    IoError(io::Error),
    CsvError(csv::Error),
    JsonError(serde_json::Error),
    /// A malformed line of input: `(line number, description)`.
    ParseError(u64, String),
    ConfigError(String),
    StateError(String),
}

impl From<io::Error> for EpiError {
    fn from(error: io::Error) -> Self {
        EpiError::IoError(error)
    }
}

impl From<csv::Error> for EpiError {
    fn from(error: csv::Error) -> Self {
        EpiError::CsvError(error)
    }
}

impl From<serde_json::Error> for EpiError {
    fn from(error: serde_json::Error) -> Self {
        EpiError::JsonError(error)
    }
}

impl std::error::Error for EpiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EpiError::IoError(error) => Some(error),
            EpiError::CsvError(error) => Some(error),
            EpiError::JsonError(error) => Some(error),
            _ => None,
        }
    }
}

impl Display for EpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpiError::IoError(error) => write!(f, "I/O error: {error}"),
            EpiError::CsvError(error) => write!(f, "CSV error: {error}"),
            EpiError::JsonError(error) => write!(f, "JSON error: {error}"),
            EpiError::ParseError(line, message) => write!(f, "parse error on line {line}: {message}"),
            EpiError::ConfigError(message) => write!(f, "configuration error: {message}"),
            EpiError::StateError(message) => write!(f, "simulation state error: {message}"),
        }
    }
}
