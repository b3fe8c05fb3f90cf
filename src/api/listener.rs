//! Reader event loop: bytes in, sentences routed out.

use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, error, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::proto::{Receiver, ReplyWord};

use super::{ConnectionEvent, Error, Shared};

const READ_BUFFER_CAPACITY: usize = 16384;

/// Reader task. Owns the socket read half and the receiver state for the
/// connection's lifetime; everything it emits goes through the tag router
/// on this task, which is what serializes delivery.
pub(crate) async fn event_loop<R>(mut read: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut receiver = Receiver::new();
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    debug!("event loop: running");

    loop {
        let result = match shared.idle_timeout {
            Some(limit) => match timeout(limit, read.read_buf(&mut buffer)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("no data for {limit:?}, closing");
                    shared.emit(ConnectionEvent::Timeout);
                    shared.teardown("idle timeout");
                    return;
                }
            },
            None => read.read_buf(&mut buffer).await,
        };

        match result {
            Ok(0) => {
                debug!("event loop: transport closed");
                shared.teardown("connection closed");
                return;
            }
            Ok(n) => {
                trace!("event loop: {n} new bytes");
                let chunk = buffer.split();

                let sentences = match receiver.feed(&chunk) {
                    Ok(sentences) => sentences,
                    Err(frame_error) => {
                        error!("unrecoverable framing error: {frame_error}");
                        shared.emit(ConnectionEvent::Error(frame_error.into()));
                        shared.teardown("protocol violation");
                        return;
                    }
                };

                for sentence in sentences {
                    trace!("event loop: {:?}", sentence.words());

                    match sentence.reply() {
                        Err(frame_error) => {
                            error!("unknown reply word: {frame_error}");
                            shared.emit(ConnectionEvent::Error(frame_error.into()));
                            shared.teardown("protocol violation");
                            return;
                        }
                        Ok(ReplyWord::Fatal) => {
                            let reason = sentence.reason().unwrap_or("fatal from router");
                            error!("received !fatal from the router: {reason}");
                            shared.teardown(reason);
                            return;
                        }
                        Ok(_) => {
                            if let Err(e @ Error::UnregisteredTag(_)) =
                                shared.router.dispatch(sentence)
                            {
                                // Non-fatal: the sentence is dropped but the
                                // connection stays up.
                                shared.emit(ConnectionEvent::Error(e));
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!("read failed: {e}");
                shared.emit(ConnectionEvent::Error(e.into()));
                shared.teardown("transport error");
                return;
            }
        }
    }
}
