//! One-shot command channel.

use std::sync::Arc;

use log::{debug, trace};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::proto::{ReplyWord, Row, Sentence};

use super::error::{is_interrupted, Error};
use super::Shared;

/// Handle for a single tagged command.
///
/// Created by [`RouterOsApi::command`](super::RouterOsApi::command): the
/// request is already on the wire by the time the caller holds one of
/// these. Dropping the handle releases its tag.
pub struct Channel {
    tag: String,
    shared: Arc<Shared>,
    replies: UnboundedReceiver<Sentence>,
}

impl Channel {
    /// Allocate a tag, subscribe it and transmit `words` plus `.tag=<T>`.
    pub(crate) fn open(shared: &Arc<Shared>, words: Vec<String>) -> Result<Self, Error> {
        let tag = shared.tags.next();
        let replies = shared.router.subscribe(&tag);

        let mut words = words;
        words.push(format!(".tag={tag}"));

        debug!("channel {tag}: {}", words.first().map_or("", String::as_str));

        if let Err(e) = shared.transmitter.send(&Sentence::from_words(words)) {
            shared.router.unsubscribe(&tag);
            return Err(e.into());
        }

        Ok(Self {
            tag,
            shared: Arc::clone(shared),
            replies,
        })
    }

    /// Tag carried by every reply to this command.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Next reply sentence for this tag, in wire order.
    ///
    /// Most callers want [`Channel::collect`]; this is the escape hatch
    /// for commands whose replies should be observed one by one.
    pub async fn next_reply(&mut self) -> Result<Sentence, Error> {
        self.replies.recv().await.ok_or(Error::ConnectionLost)
    }

    /// Collect `!re` rows until the command completes.
    ///
    /// `!done` yields the accumulated rows. `!trap` surfaces the router's
    /// message after the trailing `!done` is reaped, so the tag is not
    /// left behind to misfire. A `!fatal` (real or synthesized on
    /// transport loss) yields [`Error::ConnectionLost`].
    pub async fn collect(mut self) -> Result<Vec<Row>, Error> {
        let mut rows = Vec::new();

        loop {
            let sentence = self.next_reply().await?;

            match sentence.reply()? {
                ReplyWord::Re => rows.push(sentence.row()),
                ReplyWord::Done => {
                    trace!("channel {}: done, {} row(s)", self.tag, rows.len());
                    return Ok(rows);
                }
                ReplyWord::Trap => {
                    let trap = Error::from_trap(&sentence);
                    self.drain_to_done().await;
                    return Err(trap);
                }
                ReplyWord::Fatal => return Err(Error::ConnectionLost),
            }
        }
    }

    /// Cancel the command in-band and wait for the router to acknowledge.
    ///
    /// Sends `/cancel =tag=<T>` on a fresh tag, then holds this tag's
    /// subscription open until the `!trap message=interrupted` and the
    /// closing `!done` have arrived. Only then is the tag released, so a
    /// late `!re` can never reach a recycled subscriber.
    pub async fn cancel(mut self) -> Result<(), Error> {
        let canceller = Channel::open(
            &self.shared,
            vec!["/cancel".to_owned(), format!("=tag={}", self.tag)],
        )?;

        loop {
            let sentence = self.next_reply().await?;
            match sentence.reply()? {
                ReplyWord::Re => trace!("channel {}: discarding row during cancel", self.tag),
                ReplyWord::Trap if is_interrupted(&sentence) => {
                    trace!("channel {}: cancel acknowledged", self.tag);
                }
                ReplyWord::Trap => {
                    // The command failed on its own while the cancel was in
                    // flight; that error wins.
                    let trap = Error::from_trap(&sentence);
                    self.drain_to_done().await;
                    let _ = canceller.collect().await;
                    return Err(trap);
                }
                ReplyWord::Done => break,
                ReplyWord::Fatal => return Err(Error::ConnectionLost),
            }
        }

        // Reap the cancel command's own completion.
        let _ = canceller.collect().await;
        Ok(())
    }

    /// Consume replies until `!done` so the router's trailing sentence for
    /// this tag does not land on an unregistered tag.
    async fn drain_to_done(&mut self) {
        while let Some(sentence) = self.replies.recv().await {
            match sentence.reply() {
                Ok(ReplyWord::Done) | Ok(ReplyWord::Fatal) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.router.unsubscribe(&self.tag);
    }
}
