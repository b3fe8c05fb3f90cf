use std::fmt::Display;

use serde::de;
use thiserror::Error;

/// Failure while decoding a reply row into a typed value.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Serde-originated error (missing field, unknown variant, ...).
    #[error("{0}")]
    Message(String),

    /// Attribute value could not be parsed as the requested type.
    #[error("bad value {value:?}: {reason}")]
    InvalidValue {
        /// The raw attribute value.
        value: String,
        /// Why it did not parse.
        reason: String,
    },
}

impl de::Error for DecodeError {
    fn custom<T: Display>(msg: T) -> Self {
        DecodeError::Message(msg.to_string())
    }
}
