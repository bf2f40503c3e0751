use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidPurl(String),
    InvalidHash(String),
    UnknownState(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidPurl(msg) => write!(f, "invalid purl: {msg}"),
            ModelError::InvalidHash(msg) => {
                write!(f, "invalid content hash: {msg}")
            }
            ModelError::UnknownState(raw) => {
                write!(f, "unknown state value: {raw}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
