//! Long-lived streaming channel with pause/resume and delivery shaping.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};

use crate::proto::{ReplyWord, Row, Sentence};

use super::channel::Channel;
use super::error::{is_interrupted, Error};
use super::Shared;

/// Section batches flush after this long without a new in-section row.
const SECTION_QUIESCENCE: Duration = Duration::from_millis(300);

/// Slack added to `=interval=` before a silent tick is synthesized.
const DEBOUNCE_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Streaming,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Trapped,
}

enum Control {
    Pause(oneshot::Sender<Result<(), Error>>),
    Resume(oneshot::Sender<Result<(), Error>>),
    Stop(oneshot::Sender<Result<(), Error>>),
}

/// Handle for a long-lived subscription (`/.../listen`, `/tool/torch`).
///
/// Data arrives through the [`futures::Stream`] impl as row batches: one
/// row per item for plain streams, whole sections for section-demarcated
/// streams, and an empty batch when an `=interval=` stream stays silent
/// past its debounce window. After a terminal transition the stream yields
/// `None` forever; [`StreamChannel::pause`] and [`StreamChannel::resume`]
/// then fail with [`Error::StreamClosed`].
pub struct StreamChannel {
    tag: String,
    control: UnboundedSender<Control>,
    data: UnboundedReceiver<Result<Vec<Row>, Error>>,
}

impl StreamChannel {
    /// Subscribe a fresh tag, transmit the request and spawn the worker.
    pub(crate) fn open(shared: &Arc<Shared>, words: Vec<String>) -> Result<Self, Error> {
        let tag = shared.tags.next();
        let replies = shared.router.subscribe(&tag);

        let mut request = words;
        request.push(format!(".tag={tag}"));

        debug!("stream {tag}: {}", request.first().map_or("", String::as_str));

        if let Err(e) = shared.transmitter.send(&Sentence::from_words(request.clone())) {
            shared.router.unsubscribe(&tag);
            return Err(e.into());
        }

        // `=interval=N` means the router ticks every N seconds; anything
        // quieter than that plus grace is worth reporting as "no changes".
        let interval = request
            .iter()
            .find_map(|w| w.strip_prefix("=interval="))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs) + DEBOUNCE_GRACE);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let worker = StreamWorker {
            shared: Arc::clone(shared),
            tag: tag.clone(),
            request,
            replies,
            control: control_rx,
            out: data_tx,
            state: StreamState::Streaming,
            section: None,
            batch: Vec::new(),
            interval,
            section_deadline: None,
            debounce_deadline: None,
        };
        tokio::spawn(worker.run());

        Ok(Self {
            tag,
            control: control_tx,
            data: data_rx,
        })
    }

    /// Tag of the underlying command.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Suspend delivery: cancels the command in-band and completes once
    /// the router has acknowledged with `!trap message=interrupted` and
    /// the closing `!done`.
    pub async fn pause(&self) -> Result<(), Error> {
        self.transition(Control::Pause).await
    }

    /// Re-issue the original request on the same tag and go back to
    /// streaming.
    pub async fn resume(&self) -> Result<(), Error> {
        self.transition(Control::Resume).await
    }

    /// Tear the stream down. Idempotent: stopping a stream that already
    /// terminated is a no-op.
    pub async fn stop(&self) -> Result<(), Error> {
        match self.transition(Control::Stop).await {
            Err(Error::StreamClosed) => Ok(()),
            result => result,
        }
    }

    async fn transition(
        &self,
        make: fn(oneshot::Sender<Result<(), Error>>) -> Control,
    ) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(make(ack))
            .map_err(|_| Error::StreamClosed)?;
        done.await.map_err(|_| Error::StreamClosed)?
    }
}

impl futures::Stream for StreamChannel {
    type Item = Result<Vec<Row>, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.data.poll_recv(cx)
    }
}

/// Per-stream worker task: owns the tag subscription, the state machine
/// and both delivery timers.
struct StreamWorker {
    shared: Arc<Shared>,
    tag: String,
    /// Original request words (tag included), re-sent on resume.
    request: Vec<String>,
    replies: UnboundedReceiver<Sentence>,
    control: UnboundedReceiver<Control>,
    out: UnboundedSender<Result<Vec<Row>, Error>>,
    state: StreamState,
    /// Section id the current batch belongs to.
    section: Option<String>,
    batch: Vec<Row>,
    interval: Option<Duration>,
    section_deadline: Option<Instant>,
    debounce_deadline: Option<Instant>,
}

impl StreamWorker {
    async fn run(mut self) {
        if let Some(interval) = self.interval {
            self.debounce_deadline = Some(Instant::now() + interval);
        }

        // Both timers are created once and only ever reset; deadlines are
        // absolute so re-resetting to the current value is harmless.
        let section_timer = sleep_until(Instant::now());
        tokio::pin!(section_timer);
        let debounce_timer = sleep_until(Instant::now());
        tokio::pin!(debounce_timer);

        loop {
            if let Some(deadline) = self.section_deadline {
                section_timer.as_mut().reset(deadline);
            }
            if let Some(deadline) = self.debounce_deadline {
                debounce_timer.as_mut().reset(deadline);
            }

            tokio::select! {
                biased;

                ctrl = self.control.recv() => match ctrl {
                    Some(Control::Pause(ack)) => {
                        if !self.handle_pause(ack).await {
                            break;
                        }
                    }
                    Some(Control::Resume(ack)) => self.handle_resume(ack),
                    Some(Control::Stop(ack)) => {
                        self.handle_stop(Some(ack)).await;
                        break;
                    }
                    // Handle dropped: tear down as an implicit stop.
                    None => {
                        self.handle_stop(None).await;
                        break;
                    }
                },

                reply = self.replies.recv() => match reply {
                    Some(sentence) => {
                        if !self.handle_sentence(sentence) {
                            break;
                        }
                    }
                    None => {
                        let _ = self.out.send(Err(Error::ConnectionLost));
                        self.state = StreamState::Trapped;
                        break;
                    }
                },

                _ = section_timer.as_mut(), if self.section_deadline.is_some() => {
                    trace!("stream {}: section quiescence, flushing", self.tag);
                    self.flush_batch();
                }

                _ = debounce_timer.as_mut(), if self.debounce_deadline.is_some() => {
                    trace!("stream {}: interval elapsed without data", self.tag);
                    let _ = self.out.send(Ok(Vec::new()));
                    self.debounce_deadline =
                        self.interval.map(|interval| Instant::now() + interval);
                }
            }
        }

        self.shared.router.unsubscribe(&self.tag);
        debug!("stream {}: worker exiting as {:?}", self.tag, self.state);
    }

    /// Process one wire sentence. Returns `false` on a terminal transition.
    fn handle_sentence(&mut self, sentence: Sentence) -> bool {
        let reply = match sentence.reply() {
            Ok(reply) => reply,
            Err(e) => {
                let _ = self.out.send(Err(e.into()));
                self.state = StreamState::Trapped;
                return false;
            }
        };

        match reply {
            ReplyWord::Re => {
                if self.state != StreamState::Streaming {
                    debug!("stream {}: row while {:?}, dropping", self.tag, self.state);
                    return true;
                }

                let row = sentence.row();
                match sentence.section() {
                    Some(section) => {
                        if self.section.as_deref() != Some(section) {
                            // Section boundary: ship the previous snapshot.
                            self.flush_batch();
                            self.section = Some(section.to_owned());
                        }
                        self.batch.push(row);
                        self.section_deadline = Some(Instant::now() + SECTION_QUIESCENCE);
                    }
                    None => {
                        let _ = self.out.send(Ok(vec![row]));
                    }
                }

                if let Some(interval) = self.interval {
                    self.debounce_deadline = Some(Instant::now() + interval);
                }
                true
            }

            ReplyWord::Done => {
                // The router ended the subscription on its own.
                debug!("stream {}: done from router", self.tag);
                self.flush_batch();
                self.state = StreamState::Stopped;
                false
            }

            ReplyWord::Trap if is_interrupted(&sentence) => {
                // Cancel ack for a cancel this worker did not issue right
                // now; the closing !done follows.
                debug!("stream {}: interrupted outside pause", self.tag);
                true
            }

            ReplyWord::Trap => {
                self.flush_batch();
                let _ = self.out.send(Err(Error::from_trap(&sentence)));
                self.state = StreamState::Trapped;
                false
            }

            ReplyWord::Fatal => {
                let _ = self.out.send(Err(Error::ConnectionLost));
                self.state = StreamState::Trapped;
                false
            }
        }
    }

    /// Pause handshake. Returns `false` when the connection died under it.
    async fn handle_pause(&mut self, ack: oneshot::Sender<Result<(), Error>>) -> bool {
        match self.state {
            StreamState::Streaming => {}
            StreamState::Paused => {
                let _ = ack.send(Ok(()));
                return true;
            }
            _ => {
                let _ = ack.send(Err(Error::StreamClosed));
                return true;
            }
        }

        self.state = StreamState::Pausing;
        self.flush_batch();
        self.section = None;
        self.debounce_deadline = None;

        match self.await_cancel_ack().await {
            Ok(()) => {
                self.state = StreamState::Paused;
                let _ = ack.send(Ok(()));
                true
            }
            Err(e) => {
                self.state = StreamState::Trapped;
                let _ = ack.send(Err(e));
                false
            }
        }
    }

    fn handle_resume(&mut self, ack: oneshot::Sender<Result<(), Error>>) {
        match self.state {
            StreamState::Paused => {}
            StreamState::Streaming => {
                let _ = ack.send(Ok(()));
                return;
            }
            _ => {
                let _ = ack.send(Err(Error::StreamClosed));
                return;
            }
        }

        // Same tag, same words: the subscription never went away, only the
        // router-side command did.
        match self
            .shared
            .transmitter
            .send(&Sentence::from_words(self.request.clone()))
        {
            Ok(()) => {
                self.state = StreamState::Streaming;
                if let Some(interval) = self.interval {
                    self.debounce_deadline = Some(Instant::now() + interval);
                }
                let _ = ack.send(Ok(()));
            }
            Err(e) => {
                let _ = ack.send(Err(e.into()));
            }
        }
    }

    async fn handle_stop(&mut self, ack: Option<oneshot::Sender<Result<(), Error>>>) {
        match self.state {
            StreamState::Streaming => {
                self.state = StreamState::Stopping;
                self.flush_batch();
                if let Err(e) = self.await_cancel_ack().await {
                    // The stream is going away either way; the error is
                    // only worth a log line.
                    debug!("stream {}: cancel during stop failed: {e}", self.tag);
                }
            }
            StreamState::Paused => {}
            StreamState::Stopped | StreamState::Trapped => {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                return;
            }
            StreamState::Pausing | StreamState::Stopping => {}
        }

        self.state = StreamState::Stopped;
        if let Some(ack) = ack {
            let _ = ack.send(Ok(()));
        }
    }

    /// Issue `/cancel =tag=<T>` and wait until the router has confirmed
    /// with `!trap message=interrupted` and closed the tag with `!done`.
    async fn await_cancel_ack(&mut self) -> Result<(), Error> {
        let canceller = Channel::open(
            &self.shared,
            vec!["/cancel".to_owned(), format!("=tag={}", self.tag)],
        )?;

        let result = loop {
            let Some(sentence) = self.replies.recv().await else {
                break Err(Error::ConnectionLost);
            };

            let reply = match sentence.reply() {
                Ok(reply) => reply,
                Err(e) => break Err(e.into()),
            };

            match reply {
                ReplyWord::Re => {
                    // Data that was in flight before the cancel reached the
                    // router; the consumer asked for silence.
                    trace!("stream {}: dropping in-flight row", self.tag);
                }
                ReplyWord::Trap if is_interrupted(&sentence) => {
                    trace!("stream {}: cancel acknowledged", self.tag);
                }
                ReplyWord::Trap => {
                    warn!("stream {}: trap during cancel", self.tag);
                    break Err(Error::from_trap(&sentence));
                }
                ReplyWord::Done => break Ok(()),
                ReplyWord::Fatal => break Err(Error::ConnectionLost),
            }
        };

        // Reap the cancel command's own completion either way.
        let _ = canceller.collect().await;
        result
    }

    fn flush_batch(&mut self) {
        self.section_deadline = None;
        if !self.batch.is_empty() {
            let batch = std::mem::take(&mut self.batch);
            trace!("stream {}: delivering {} row(s)", self.tag, batch.len());
            let _ = self.out.send(Ok(batch));
        }
    }
}
