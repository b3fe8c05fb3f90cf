//! Connection engine: lifecycle, login and command dispatch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::proto::{transmitter, ReplyWord, Sentence, Transmitter};

pub mod config;
pub mod de;
pub mod error;

mod channel;
mod listener;
mod router;
mod stream;
mod tag;
pub(crate) mod transport;

pub use channel::Channel;
pub use config::{ApiConfig, TlsConfig};
pub use error::{Error, TrapCategory};
pub use stream::StreamChannel;
pub use transport::AsyncStream;

use router::TagRouter;
use tag::TagAllocator;

/// Marker trait for the connection typestate.
pub trait State {}

/// Socket is up but the user has not authenticated yet.
pub struct Disconnected;

/// User is authenticated and has access to the full API.
pub struct Authenticated;

impl State for Disconnected {}
impl State for Authenticated {}

/// Connection lifecycle, observable through [`RouterOsApi::lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No transport yet.
    Idle,
    /// Dialing.
    Connecting,
    /// Transport up, engine running.
    Connected,
    /// Client-initiated teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// Out-of-band connection notifications, delivered through the typed
/// channel returned by [`RouterOsApi::events`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Engine attached to the transport.
    Connected,
    /// Connection is gone; `reason` says why.
    Close {
        /// Human-readable teardown cause.
        reason: String,
    },
    /// Something went wrong. Fatal errors are followed by `Close`;
    /// [`Error::UnregisteredTag`] is informational.
    Error(Error),
    /// Idle timeout expired; `Close` follows.
    Timeout,
}

/// State shared between the connection handle, its channels and the
/// reader/writer tasks. The socket itself is owned by those tasks; every
/// other component goes through the transmitter and the router.
pub(crate) struct Shared {
    pub(crate) transmitter: Transmitter,
    pub(crate) router: TagRouter,
    pub(crate) tags: TagAllocator,
    pub(crate) idle_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Idempotent teardown: close the transmitter first so nothing new
    /// reaches the wire, then fail every open channel with a synthetic
    /// `!fatal`.
    pub(crate) fn teardown(&self, reason: &str) {
        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock");
            if *lifecycle == Lifecycle::Closed {
                return;
            }
            *lifecycle = Lifecycle::Closed;
        }

        debug!("tearing down connection: {reason}");
        self.transmitter.close();
        self.router.fail_all(reason);
        self.emit(ConnectionEvent::Close {
            reason: reason.to_owned(),
        });
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        *self.lifecycle.lock().expect("lifecycle lock") = state;
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().expect("lifecycle lock")
    }
}

/// Format a command path and `(key, value)` attribute pairs into words.
///
/// Keys starting with `?` become query words (bare when the value is
/// empty), keys starting with `.` or `=` are passed through as API
/// attributes, everything else becomes an `=key=value` attribute word.
#[must_use]
pub fn command_words(command: &str, attributes: &[(&str, &str)]) -> Vec<String> {
    let mut words = Vec::with_capacity(1 + attributes.len());

    words.push(command.to_owned());

    for (key, value) in attributes {
        if key.starts_with('?') {
            if value.is_empty() {
                words.push((*key).to_string());
            } else {
                words.push(format!("{key}={value}"));
            }
        } else if key.starts_with(['.', '=']) {
            //.proplist, .tag
            words.push(format!("{key}={value}"));
        } else {
            // everything else (attributes)
            words.push(format!("={key}={value}"));
        }
    }

    words
}

/// Handle to one router connection.
///
/// Commands multiplex freely: every [`Channel`] and [`StreamChannel`]
/// carries its own tag, so a single connection serves any number of
/// concurrent commands.
pub struct RouterOsApi<S: State> {
    shared: Arc<Shared>,
    events: Option<UnboundedReceiver<ConnectionEvent>>,
    reader: JoinHandle<()>,
    _state: S,
}

/// Attach the engine to an established transport.
pub(crate) fn attach<T>(io: T, config: &ApiConfig) -> RouterOsApi<Disconnected>
where
    T: AsyncStream + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        transmitter: Transmitter::new(),
        router: TagRouter::new(),
        tags: TagAllocator::new(),
        idle_timeout: config.idle_timeout(),
        events: events_tx,
        lifecycle: Mutex::new(Lifecycle::Connected),
    });

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(transmitter::run_writer(write_half, frames_rx));
    let reader = tokio::spawn(listener::event_loop(read_half, Arc::clone(&shared)));

    shared.transmitter.connected(frames_tx);
    shared.emit(ConnectionEvent::Connected);

    RouterOsApi {
        shared,
        events: Some(events_rx),
        reader,
        _state: Disconnected,
    }
}

impl<S: State> RouterOsApi<S> {
    /// Take the connection event channel. Yields `None` once taken.
    pub fn events(&mut self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    /// Close the connection. Every open channel and stream terminates
    /// with [`Error::ConnectionLost`].
    pub fn close(self) {
        self.shared.set_lifecycle(Lifecycle::Closing);
        self.shared.teardown("closed by client");
        self.reader.abort();
    }
}

impl RouterOsApi<Disconnected> {
    /// Authenticate with the router.
    ///
    /// Sends the plain post-6.43 `/login`; when the router answers with a
    /// `=ret=` challenge instead, the legacy MD5 response round is played
    /// automatically.
    pub async fn login(
        mut self,
        username: &str,
        password: &str,
    ) -> Result<RouterOsApi<Authenticated>, Error> {
        // Login replies carry no tag; observe them on the global channel.
        let mut global = self.shared.router.subscribe_global();
        let result = self.do_login(&mut global, username, password).await;
        self.shared.router.release_global();

        result?;
        debug!("login successful for {username}");

        Ok(RouterOsApi {
            shared: self.shared,
            events: self.events.take(),
            reader: self.reader,
            _state: Authenticated,
        })
    }

    async fn do_login(
        &self,
        global: &mut UnboundedReceiver<Sentence>,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        self.shared.transmitter.send(&Sentence::from_words([
            "/login".to_owned(),
            format!("=name={username}"),
            format!("=password={password}"),
        ]))?;

        let reply = Self::login_reply(global).await?;
        match reply.reply()? {
            ReplyWord::Done => match reply.attribute("ret") {
                Some(challenge) => {
                    self.challenge_login(global, username, password, challenge.to_owned())
                        .await
                }
                None => Ok(()),
            },
            ReplyWord::Trap => Err(login_rejected(&reply)),
            _ => Err(Error::ConnectionLost),
        }
    }

    /// Legacy pre-6.43 round: `=response=00<md5(0x00 + password + challenge)>`.
    async fn challenge_login(
        &self,
        global: &mut UnboundedReceiver<Sentence>,
        username: &str,
        password: &str,
        challenge_hex: String,
    ) -> Result<(), Error> {
        debug!("router requested challenge-response login");

        let challenge = hex::decode(&challenge_hex)
            .map_err(|_| Error::LoginRejected("malformed login challenge".to_owned()))?;

        let mut data = Vec::with_capacity(1 + password.len() + challenge.len());
        data.push(0u8);
        data.extend_from_slice(password.as_bytes());
        data.extend_from_slice(&challenge);
        let digest = md5::compute(&data);

        let mut response = String::from("00");
        response.push_str(&hex::encode(digest.0));

        self.shared.transmitter.send(&Sentence::from_words([
            "/login".to_owned(),
            format!("=name={username}"),
            format!("=response={response}"),
        ]))?;

        let reply = Self::login_reply(global).await?;
        match reply.reply()? {
            ReplyWord::Done => Ok(()),
            ReplyWord::Trap => Err(login_rejected(&reply)),
            _ => Err(Error::ConnectionLost),
        }
    }

    /// Next non-`!re` sentence on the global channel.
    async fn login_reply(global: &mut UnboundedReceiver<Sentence>) -> Result<Sentence, Error> {
        loop {
            let sentence = global.recv().await.ok_or(Error::ConnectionLost)?;
            if sentence.reply()? == ReplyWord::Re {
                warn!("unexpected data row during login, ignoring");
                continue;
            }
            return Ok(sentence);
        }
    }
}

fn login_rejected(reply: &Sentence) -> Error {
    Error::LoginRejected(
        reply
            .attribute("message")
            .unwrap_or("bad credentials")
            .to_owned(),
    )
}

impl RouterOsApi<Authenticated> {
    /// Issue a one-shot command; replies arrive on the returned channel.
    pub fn command<I, W>(&self, words: I) -> Result<Channel, Error>
    where
        I: IntoIterator<Item = W>,
        W: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        trace!("command: {words:?}");
        Channel::open(&self.shared, words)
    }

    /// Open a long-lived subscription (`listen`, `/tool/torch`, ...).
    pub fn stream<I, W>(&self, words: I) -> Result<StreamChannel, Error>
    where
        I: IntoIterator<Item = W>,
        W: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        trace!("stream: {words:?}");
        StreamChannel::open(&self.shared, words)
    }

    /// Run a command to completion and decode every row into `T`.
    pub async fn fetch_all<T, I, W>(&self, words: I) -> Result<Vec<T>, Error>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = W>,
        W: Into<String>,
    {
        let rows = self.command(words)?.collect().await?;

        rows.iter()
            .map(|row| de::from_row(row).map_err(Error::from))
            .collect()
    }
}
