//! Error taxonomy for the engine.

use std::io;

use thiserror::Error;

use crate::proto::{FrameError, Sentence};

/// Errors surfaced by connections, channels and streams.
#[derive(Debug, Error)]
pub enum Error {
    /// The byte stream or sentence structure violated the protocol.
    /// Fatal at connection scope.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] FrameError),

    /// The transport closed or reset underneath open commands.
    #[error("connection lost")]
    ConnectionLost,

    /// The router actively refused the TCP connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// Connect or idle timeout expired.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// TLS negotiation with the router failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The router refused the credentials.
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// `!trap` reply: an error scoped to a single command.
    #[error("error from router: {message}")]
    Trap {
        /// Well-known trap category, when the router sent one.
        category: Option<TrapCategory>,
        /// Human-readable message from the router.
        message: String,
    },

    /// A sentence arrived for a tag nobody subscribes to. The sentence is
    /// dropped; the connection stays usable.
    #[error("no subscriber for tag {0:?}")]
    UnregisteredTag(String),

    /// Write attempted on a closed connection.
    #[error("not connected")]
    NotConnected,

    /// `pause`/`resume` on a stream that already terminated.
    #[error("stream closed")]
    StreamClosed,

    /// A reply row did not decode into the requested type.
    #[error("decode error: {0}")]
    Decode(#[from] super::de::DecodeError),

    /// Rejected configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level IO failure.
    #[error("IO error")]
    Io(#[from] io::Error),
}

impl From<crate::proto::NotConnected> for Error {
    fn from(_: crate::proto::NotConnected) -> Self {
        Error::NotConnected
    }
}

impl Error {
    /// Build a [`Error::Trap`] from a received `!trap` sentence.
    pub(crate) fn from_trap(sentence: &Sentence) -> Self {
        let category = sentence
            .attribute("category")
            .and_then(|v| v.parse::<u8>().ok())
            .and_then(|v| TrapCategory::try_from(v).ok());

        let message = sentence.attribute("message").unwrap_or("trap").to_owned();

        Error::Trap { category, message }
    }
}

/// Whether a `!trap` is the router's acknowledgement of an in-band cancel
/// rather than a real failure.
///
/// Only the message text identifies the ack. Category 2 is not enough:
/// the router uses it for any interrupted execution, including failures
/// unrelated to a `/cancel` this engine issued.
pub(crate) fn is_interrupted(sentence: &Sentence) -> bool {
    sentence.attribute("message") == Some("interrupted")
}

/// Possible values for the `!trap` `category` attribute.
/// From https://wiki.mikrotik.com/wiki/Manual:API#category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCategory {
    /// 0 - missing item or command
    MissingItemOrCommand,

    /// 1 - argument value failure
    ArgumentValueFailure,

    /// 2 - execution of command interrupted
    CommandExecutionInterrupted,

    /// 3 - scripting related failure
    ScriptingFailure,

    /// 4 - general failure
    GeneralFailure,

    /// 5 - API related failure
    APIFailure,

    /// 6 - TTY related failure
    TTYFailure,

    /// 7 - value generated with :return command
    ReturnValue,
}

impl TryFrom<u8> for TrapCategory {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        use TrapCategory::*;
        match value {
            0 => Ok(MissingItemOrCommand),
            1 => Ok(ArgumentValueFailure),
            2 => Ok(CommandExecutionInterrupted),
            3 => Ok(ScriptingFailure),
            4 => Ok(GeneralFailure),
            5 => Ok(APIFailure),
            6 => Ok(TTYFailure),
            7 => Ok(ReturnValue),
            unknown => Err(unknown),
        }
    }
}
