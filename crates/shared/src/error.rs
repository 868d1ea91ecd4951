//! Error types for Tierline shared types

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SharedError {
    #[error("Invalid {kind}: {value}")]
    InvalidValue { kind: &'static str, value: String },

    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

impl SharedError {
    pub(crate) fn invalid(kind: &'static str, value: &str) -> Self {
        Self::InvalidValue {
            kind,
            value: value.to_string(),
        }
    }
}
