//! Tag router: demultiplexes received sentences to their subscribers.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, trace, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::proto::Sentence;

use super::error::Error;

/// Owner of the `tag → subscriber` map and the untagged global channel.
///
/// Dispatch happens on the reader task, so subscribers observe sentences
/// in exact wire order for their tag.
#[derive(Default)]
pub(crate) struct TagRouter {
    subscribers: Mutex<HashMap<String, UnboundedSender<Sentence>>>,
    global: Mutex<Option<UnboundedSender<Sentence>>>,
}

impl TagRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `tag` and return its reply feed.
    pub(crate) fn subscribe(&self, tag: &str) -> UnboundedReceiver<Sentence> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut map = self.subscribers.lock().expect("router lock");
        let previous = map.insert(tag.to_owned(), tx);
        // The allocator never hands out a tag twice.
        debug_assert!(previous.is_none(), "duplicate subscription for tag {tag}");

        trace!("subscribed tag {tag}");
        rx
    }

    /// Remove the subscriber for `tag`. No further sentences are delivered
    /// once this returns.
    pub(crate) fn unsubscribe(&self, tag: &str) {
        let mut map = self.subscribers.lock().expect("router lock");
        if map.remove(tag).is_some() {
            trace!("unsubscribed tag {tag}");
        }
    }

    /// Claim the global channel, where untagged sentences are routed.
    /// Used for the login handshake.
    pub(crate) fn subscribe_global(&self) -> UnboundedReceiver<Sentence> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.global.lock().expect("router lock") = Some(tx);
        rx
    }

    /// Release the global channel.
    pub(crate) fn release_global(&self) {
        *self.global.lock().expect("router lock") = None;
    }

    /// Route one sentence by its `.tag=` word.
    ///
    /// An unknown tag is a programming error on one side of the wire; the
    /// sentence is dropped and the error is surfaced so the connection can
    /// report it without tearing down.
    pub(crate) fn dispatch(&self, sentence: Sentence) -> Result<(), Error> {
        match sentence.tag() {
            Some(tag) => {
                let tag = tag.to_owned();
                let mut map = self.subscribers.lock().expect("router lock");

                match map.get(&tag) {
                    Some(subscriber) => {
                        if subscriber.send(sentence).is_err() {
                            // Receiver side went away without unsubscribing.
                            debug!("subscriber for tag {tag} is gone, dropping");
                            map.remove(&tag);
                        }
                        Ok(())
                    }
                    None => {
                        warn!("sentence for unregistered tag {tag}, dropping");
                        Err(Error::UnregisteredTag(tag))
                    }
                }
            }
            None => {
                let global = self.global.lock().expect("router lock");
                match &*global {
                    Some(subscriber) if subscriber.send(sentence).is_ok() => {}
                    _ => debug!("untagged sentence with no global subscriber, dropping"),
                }
                Ok(())
            }
        }
    }

    /// Deliver one synthetic `!fatal` to every live subscriber and clear
    /// the map. Called when the transport is gone.
    pub(crate) fn fail_all(&self, reason: &str) {
        let fatal = Sentence::from_words(["!fatal", reason]);

        let mut map = self.subscribers.lock().expect("router lock");
        for (tag, subscriber) in map.drain() {
            trace!("failing tag {tag}: {reason}");
            let _ = subscriber.send(fatal.clone());
        }

        let mut global = self.global.lock().expect("router lock");
        if let Some(subscriber) = global.take() {
            let _ = subscriber.send(fatal);
        }
    }

    #[cfg(test)]
    fn live_tags(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
