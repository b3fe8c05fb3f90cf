//! Sentence model: reply categories, tags, attributes and rows.

use std::collections::HashMap;

use super::FrameError;

/// Attribute map of one `!re` reply, keyed by attribute name.
pub type Row = HashMap<String, String>;

/// Category carried in the first word of every sentence the router sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyWord {
    /// `!re`, one data row.
    Re,
    /// `!done`, terminal success.
    Done,
    /// `!trap`, command-scoped error.
    Trap,
    /// `!fatal`, connection-scoped failure.
    Fatal,
}

impl ReplyWord {
    /// Parse a reply word. Anything else starting a received sentence is
    /// a protocol violation: the router only ever leads with these four.
    pub fn parse(word: &str) -> Result<Self, FrameError> {
        match word {
            "!re" => Ok(ReplyWord::Re),
            "!done" => Ok(ReplyWord::Done),
            "!trap" => Ok(ReplyWord::Trap),
            "!fatal" => Ok(ReplyWord::Fatal),
            other => Err(FrameError::UnknownReply(other.to_owned())),
        }
    }
}

/// An ordered word list, as framed on the wire (terminator excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    words: Vec<String>,
}

impl Sentence {
    pub(crate) fn new(words: Vec<String>) -> Self {
        Self { words }
    }

    /// Build a sentence from command words, e.g. for transmission.
    pub fn from_words<S: Into<String>, I: IntoIterator<Item = S>>(words: I) -> Self {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    /// The words of this sentence, in wire order.
    #[must_use]
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Reply category of a received sentence.
    pub fn reply(&self) -> Result<ReplyWord, FrameError> {
        match self.words.first() {
            Some(first) => ReplyWord::parse(first),
            None => Err(FrameError::UnknownReply(String::new())),
        }
    }

    /// Value of the `.tag=` API attribute, if present.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.words.iter().find_map(|w| w.strip_prefix(".tag="))
    }

    /// Value of the `.section=` API attribute, if present.
    #[must_use]
    pub fn section(&self) -> Option<&str> {
        self.words.iter().find_map(|w| w.strip_prefix(".section="))
    }

    /// Value of the `=key=value` attribute word named `key`.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    /// All attribute words as `(key, value)` pairs.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.words
            .iter()
            .filter_map(|w| w.strip_prefix('=').and_then(|kv| kv.split_once('=')))
    }

    /// Collect the attribute words into a [`Row`].
    #[must_use]
    pub fn row(&self) -> Row {
        self.attributes()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    /// Free-string words after the reply word (`!fatal` reason).
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.words
            .iter()
            .skip(1)
            .find(|w| !w.starts_with(['=', '.', '!']))
            .map(String::as_str)
    }
}
