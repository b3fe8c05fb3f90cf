//! Wire protocol: framing, sentences and the outbound queue.
//!
//! The RouterOS binary API frames everything as *words* (length-prefixed
//! byte strings) grouped into *sentences* (word lists closed by a
//! zero-length word). This module is the full codec: it has no opinion on
//! what commands mean and can be driven standalone, e.g. to script a fake
//! router in tests.

pub mod length;
pub mod receiver;
pub mod transmitter;
pub mod word;

mod sentence;

use thiserror::Error;

pub use receiver::Receiver;
pub use sentence::{ReplyWord, Row, Sentence};
pub use transmitter::{encode_sentence, NotConnected, Transmitter};

/// Unrecoverable framing failure; the byte stream cannot be resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// First byte of a length prefix is a reserved control value.
    #[error("malformed length prefix: {0:#04x}")]
    BadLengthPrefix(u8),

    /// Decoded word length exceeds the protocol's 31-bit range.
    #[error("word length {0:#x} out of range")]
    OversizedWord(u32),

    /// Received sentence does not start with a known reply word.
    #[error("unknown reply word: {0:?}")]
    UnknownReply(String),
}
