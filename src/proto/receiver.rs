//! Incremental sentence decoder.
//!
//! The receiver consumes byte chunks exactly as the transport produces
//! them. No alignment between TCP segments and protocol structure is
//! assumed: a chunk may end inside a length prefix, inside a word payload,
//! or carry several complete sentences at once.

use bytes::BytesMut;
use log::debug;

use super::{length, word, FrameError, Sentence};

/// Push-based decoder state machine.
///
/// State between calls to [`Receiver::feed`]:
/// * `prefix`: bytes of a partial length prefix,
/// * `expected`: payload bytes still missing from the word in progress,
/// * `word`: the partially accumulated word payload,
/// * `sentence`: complete words since the last terminator.
#[derive(Debug, Default)]
pub struct Receiver {
    prefix: Vec<u8>,
    expected: usize,
    word: BytesMut,
    sentence: Vec<String>,
}

impl Receiver {
    /// Create a receiver with empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `chunk` and return every sentence it completes.
    ///
    /// A [`FrameError`] means the byte stream is corrupt; the connection
    /// must be torn down since resynchronization is impossible.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Sentence>, FrameError> {
        let stitched;
        let mut input = if self.prefix.is_empty() {
            chunk
        } else {
            // Re-present the buffered partial prefix ahead of the new bytes.
            let mut joined = std::mem::take(&mut self.prefix);
            joined.extend_from_slice(chunk);
            stitched = joined;
            &stitched[..]
        };

        let mut out = Vec::new();

        while !input.is_empty() {
            if self.expected > 0 {
                let take = self.expected.min(input.len());
                self.word.extend_from_slice(&input[..take]);
                input = &input[take..];
                self.expected -= take;

                if self.expected == 0 {
                    self.finish_word();
                }
                continue;
            }

            match length::decode(input)? {
                None => {
                    // Sufficiency is checked before anything is consumed,
                    // so the whole remainder is the partial prefix.
                    self.prefix.extend_from_slice(input);
                    break;
                }
                Some((consumed, 0)) => {
                    input = &input[consumed..];
                    if self.sentence.is_empty() {
                        // Stray terminator between sentences; nothing to emit.
                        debug!("empty sentence on the wire, ignoring");
                    } else {
                        out.push(Sentence::new(std::mem::take(&mut self.sentence)));
                    }
                }
                Some((consumed, len)) => {
                    input = &input[consumed..];
                    self.expected = len as usize;
                    self.word.reserve(self.expected.min(0x1_0000));
                }
            }
        }

        Ok(out)
    }

    fn finish_word(&mut self) {
        let payload = self.word.split();
        if payload.len() == 1 && payload[0] == 0x00 {
            // A one-byte NUL word is valid but has been observed as packet
            // padding from some firmwares; keep it, but leave a trace.
            debug!("one-byte NUL word received");
        }
        self.sentence.push(word::decode_bytes(&payload));
    }
}
