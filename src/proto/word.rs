//! Word payload charset handling.
//!
//! RouterOS sends word payloads as Windows-1252 bytes; the crate works with
//! UTF-8 strings everywhere else, so decode/encode happens exactly once at
//! the frame boundary.

use std::borrow::Cow;

use encoding_rs::WINDOWS_1252;
use log::warn;

use super::length;

/// Decode wire bytes into a UTF-8 string.
///
/// Windows-1252 assigns a scalar value to every byte, so decoding cannot
/// fail; ASCII input passes through untouched.
#[must_use]
pub fn decode_bytes(bytes: &[u8]) -> String {
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Encode a string into its wire representation.
///
/// Characters outside the Windows-1252 repertoire cannot reach the router
/// intact; the encoder substitutes them and logs the word.
#[must_use]
pub fn encode_str(word: &str) -> Cow<'_, [u8]> {
    let (bytes, _, had_errors) = WINDOWS_1252.encode(word);
    if had_errors {
        warn!("word contains characters outside Windows-1252: {word:?}");
    }
    bytes
}

/// Encode one word as `length prefix + payload` into `out`.
pub fn encode_into(word: &str, out: &mut Vec<u8>) {
    let payload = encode_str(word);
    out.extend_from_slice(&length::encode(payload.len() as u32));
    out.extend_from_slice(&payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_round_trip() {
        for word in ["", "/login", "=name=admin", ".tag=1a", "!re"] {
            let bytes = encode_str(word);
            assert_eq!(bytes.as_ref(), word.as_bytes());
            assert_eq!(decode_bytes(&bytes), word);
        }
    }

    #[test]
    fn test_high_bytes_decode() {
        // 0xE9 is 'é' in Windows-1252, 0x80 is '€'.
        assert_eq!(decode_bytes(&[0x63, 0x61, 0x66, 0xE9]), "café");
        assert_eq!(decode_bytes(&[0x80]), "\u{20AC}");
    }

    #[test]
    fn test_non_ascii_encode() {
        assert_eq!(encode_str("café").as_ref(), &[0x63, 0x61, 0x66, 0xE9]);
    }

    #[test]
    fn test_encode_into_prefixes() {
        let mut out = Vec::new();
        encode_into("/login", &mut out);
        assert_eq!(out, b"\x06/login");
    }
}
