//! Sentence serialization and the outbound write queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use log::{debug, error, trace};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use super::{word, Sentence};

/// Write attempted after the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("not connected")]
pub struct NotConnected;

/// Encode a full sentence, terminator included, as one buffer.
///
/// Keeping the whole sentence in a single frame is what makes a sentence
/// atomic on the wire: the writer never interleaves two sentences' bytes.
#[must_use]
pub fn encode_sentence(sentence: &Sentence) -> Bytes {
    let mut out = Vec::new();
    for w in sentence.words() {
        word::encode_into(w, &mut out);
    }
    out.push(0x00);
    Bytes::from(out)
}

enum TxState {
    /// Connection not ready yet; sentences queue in FIFO order.
    Pending(VecDeque<Bytes>),
    /// Writer task attached; frames go straight to it.
    Ready(UnboundedSender<Bytes>),
    Closed,
}

/// Outbound half of the engine.
///
/// Sentences written before the transport is ready are pooled and drained
/// in order on [`Transmitter::connected`]. After [`Transmitter::close`]
/// every write fails with [`NotConnected`] and any backlog is discarded.
pub struct Transmitter {
    state: Mutex<TxState>,
}

impl Default for Transmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Transmitter {
    /// New transmitter in the pending state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TxState::Pending(VecDeque::new())),
        }
    }

    /// Queue or send one sentence.
    pub fn send(&self, sentence: &Sentence) -> Result<(), NotConnected> {
        let frame = encode_sentence(sentence);
        trace!("send: {:?}", sentence.words());

        let mut state = self.state.lock().expect("transmitter lock");
        match &mut *state {
            TxState::Pending(pool) => {
                debug!("connection not ready, pooling sentence");
                pool.push_back(frame);
                Ok(())
            }
            TxState::Ready(tx) => tx.send(frame).map_err(|_| NotConnected),
            TxState::Closed => Err(NotConnected),
        }
    }

    /// Attach the writer task and drain the pending pool in order.
    ///
    /// A closed transmitter stays closed.
    pub fn connected(&self, tx: UnboundedSender<Bytes>) {
        let mut state = self.state.lock().expect("transmitter lock");
        match &mut *state {
            TxState::Pending(pool) => {
                debug!("draining {} pooled sentence(s)", pool.len());
                let mut failed = false;
                for frame in pool.drain(..) {
                    if tx.send(frame).is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    *state = TxState::Closed;
                    return;
                }
            }
            TxState::Ready(_) => {}
            TxState::Closed => return,
        }
        *state = TxState::Ready(tx);
    }

    /// Drop the backlog and fail all future writes.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("transmitter lock");
        if let TxState::Pending(pool) = &mut *state {
            if !pool.is_empty() {
                debug!("discarding {} pooled sentence(s) on close", pool.len());
            }
        }
        *state = TxState::Closed;
    }
}

/// Writer task: owns the socket write half for the connection's lifetime.
///
/// One `write_all` + `flush` per frame, behind a [`BufWriter`]. Exits when
/// the transmitter side is dropped or the transport fails.
pub async fn run_writer<W>(write: W, mut frames: UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    let mut output = BufWriter::new(write);

    while let Some(frame) = frames.recv().await {
        if let Err(e) = output.write_all(&frame).await {
            error!("write failed: {e}");
            return;
        }
        if let Err(e) = output.flush().await {
            error!("flush failed: {e}");
            return;
        }
    }

    debug!("writer task exiting");
    let _ = output.shutdown().await;
}
