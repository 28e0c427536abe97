use std::fmt::{self, Display};

/// Errors produced by model constructors and parsers.
#[derive(Debug)]
pub enum ModelError {
    UnknownStatus(String),
    UnknownConnector(String),
    InvalidScope(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownStatus(raw) => write!(f, "unknown status: {raw}"),
            ModelError::UnknownConnector(raw) => {
                write!(f, "unknown connector: {raw}")
            }
            ModelError::InvalidScope(msg) => write!(f, "invalid scope: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
