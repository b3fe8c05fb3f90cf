//! End-to-end engine tests against a scripted router.
//!
//! The peer speaks the real wire format over an in-memory duplex pipe,
//! using the crate's own codec the way a router would: read a sentence,
//! answer with tagged replies.

use std::collections::VecDeque;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use routeros_api::proto::{encode_sentence, Receiver, Sentence};
use routeros_api::{
    command_words, ApiConfig, Authenticated, ConnectionEvent, Disconnected, Error, RouterOsApi,
};

struct FakeRouter {
    io: DuplexStream,
    receiver: Receiver,
    pending: VecDeque<Sentence>,
}

impl FakeRouter {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            receiver: Receiver::new(),
            pending: VecDeque::new(),
        }
    }

    async fn read_sentence(&mut self) -> Sentence {
        loop {
            if let Some(sentence) = self.pending.pop_front() {
                return sentence;
            }

            let mut buf = [0u8; 1024];
            let n = self.io.read(&mut buf).await.expect("router read");
            assert!(n > 0, "client closed while the router expected a sentence");

            self.pending
                .extend(self.receiver.feed(&buf[..n]).expect("router framing"));
        }
    }

    async fn send(&mut self, words: &[&str]) {
        let frame = encode_sentence(&Sentence::from_words(words.iter().copied()));
        self.io.write_all(&frame).await.expect("router write");
    }

    /// Read one `/login` and accept it.
    async fn accept_login(&mut self) {
        let login = self.read_sentence().await;
        assert_eq!(login.words()[0], "/login");
        self.send(&["!done"]).await;
    }
}

fn pipe() -> (RouterOsApi<Disconnected>, FakeRouter) {
    pipe_with(ApiConfig::new("test-router"))
}

fn pipe_with(config: ApiConfig) -> (RouterOsApi<Disconnected>, FakeRouter) {
    let (client_io, router_io) = tokio::io::duplex(4096);
    let api = routeros_api::connect_stream(client_io, &config);
    (api, FakeRouter::new(router_io))
}

async fn authenticated() -> (RouterOsApi<Authenticated>, FakeRouter) {
    let (api, mut router) = pipe();
    let (api, ()) = tokio::join!(api.login("admin", "secret"), router.accept_login());
    (api.expect("login"), router)
}

#[tokio::test]
async fn plain_login_sends_credentials() {
    let (api, mut router) = pipe();

    let script = async {
        let login = router.read_sentence().await;
        assert_eq!(
            login.words(),
            ["/login", "=name=admin", "=password=secret"]
        );
        router.send(&["!done"]).await;
    };

    let (api, ()) = tokio::join!(api.login("admin", "secret"), script);
    api.expect("login should succeed");
}

#[tokio::test]
async fn challenge_login_answers_with_md5() {
    let (api, mut router) = pipe();
    let challenge = "aa11bb22";

    let script = async {
        let first = router.read_sentence().await;
        assert_eq!(first.words()[0], "/login");
        router.send(&["!done", &format!("=ret={challenge}")]).await;

        let second = router.read_sentence().await;
        assert_eq!(second.words()[0], "/login");
        assert_eq!(second.attribute("name"), Some("admin"));

        // md5 over 0x00 + password + challenge bytes, "00"-prefixed hex.
        let mut data = vec![0u8];
        data.extend_from_slice(b"secret");
        data.extend_from_slice(&hex::decode(challenge).unwrap());
        let expected = format!("00{}", hex::encode(md5::compute(&data).0));

        assert_eq!(second.attribute("response"), Some(expected.as_str()));
        router.send(&["!done"]).await;
    };

    let (api, ()) = tokio::join!(api.login("admin", "secret"), script);
    api.expect("challenge login should succeed");
}

#[tokio::test]
async fn rejected_login_surfaces_message() {
    let (api, mut router) = pipe();

    let script = async {
        router.read_sentence().await;
        router
            .send(&["!trap", "=message=invalid user name or password (6)"])
            .await;
    };

    let (result, ()) = tokio::join!(api.login("admin", "wrong"), script);
    match result {
        Err(Error::LoginRejected(message)) => {
            assert_eq!(message, "invalid user name or password (6)");
        }
        other => panic!("unexpected: {:?}", other.err()),
    }
}

#[tokio::test]
async fn interleaved_tags_route_to_their_channels() {
    let (api, mut router) = authenticated().await;

    let first = api
        .command(command_words("/interface/print", &[]))
        .unwrap();
    let second = api.command(command_words("/ip/address/print", &[])).unwrap();

    let script = async {
        let req1 = router.read_sentence().await;
        let req2 = router.read_sentence().await;
        let tag1 = req1.tag().unwrap().to_owned();
        let tag2 = req2.tag().unwrap().to_owned();
        assert_ne!(tag1, tag2);

        // Replies deliberately interleaved across the two commands.
        router
            .send(&["!re", "=name=ether2", &format!(".tag={tag2}")])
            .await;
        router
            .send(&["!re", "=name=ether1", &format!(".tag={tag1}")])
            .await;
        router.send(&["!done", &format!(".tag={tag1}")]).await;
        router.send(&["!done", &format!(".tag={tag2}")]).await;
    };

    let (rows1, rows2, ()) = tokio::join!(first.collect(), second.collect(), script);

    let rows1 = rows1.unwrap();
    assert_eq!(rows1.len(), 1);
    assert_eq!(rows1[0]["name"], "ether1");

    let rows2 = rows2.unwrap();
    assert_eq!(rows2.len(), 1);
    assert_eq!(rows2[0]["name"], "ether2");
}

#[tokio::test]
async fn trap_terminates_command_with_message() {
    let (api, mut router) = authenticated().await;

    let channel = api
        .command(command_words("/ppp/secret/add", &[("name", "")]))
        .unwrap();

    let script = async {
        let request = router.read_sentence().await;
        let tag = request.tag().unwrap().to_owned();
        router
            .send(&[
                "!trap",
                "=category=0",
                "=message=missing value for 'name'",
                &format!(".tag={tag}"),
            ])
            .await;
        router.send(&["!done", &format!(".tag={tag}")]).await;
    };

    let (result, ()) = tokio::join!(channel.collect(), script);
    match result {
        Err(Error::Trap { message, .. }) => assert_eq!(message, "missing value for 'name'"),
        other => panic!("unexpected: {:?}", other.err()),
    }
}

#[tokio::test]
async fn cancel_waits_for_router_acknowledgement() {
    let (api, mut router) = authenticated().await;

    let channel = api
        .command(command_words("/tool/fetch", &[("url", "http://x")]))
        .unwrap();
    let original_tag = channel.tag().to_owned();

    let script = async {
        let request = router.read_sentence().await;
        assert_eq!(request.tag(), Some(original_tag.as_str()));

        let cancel = router.read_sentence().await;
        assert_eq!(cancel.words()[0], "/cancel");
        assert_eq!(cancel.attribute("tag"), Some(original_tag.as_str()));
        let cancel_tag = cancel.tag().unwrap().to_owned();

        router
            .send(&[
                "!trap",
                "=category=2",
                "=message=interrupted",
                &format!(".tag={original_tag}"),
            ])
            .await;
        router.send(&["!done", &format!(".tag={original_tag}")]).await;
        router.send(&["!done", &format!(".tag={cancel_tag}")]).await;
    };

    let (result, ()) = tokio::join!(channel.cancel(), script);
    result.expect("cancel should complete after the router's ack");
}

#[tokio::test]
async fn stream_pause_resume_and_stop() {
    let (api, mut router) = authenticated().await;

    let mut stream = api
        .stream(command_words("/ip/address/listen", &[]))
        .unwrap();
    let tag = stream.tag().to_owned();

    // Router sends three rows.
    let request = router.read_sentence().await;
    assert_eq!(request.words()[0], "/ip/address/listen");
    assert_eq!(request.tag(), Some(tag.as_str()));

    for i in 0..3 {
        router
            .send(&["!re", &format!("=address=10.0.0.{i}/24"), &format!(".tag={tag}")])
            .await;
    }
    for i in 0..3 {
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0]["address"], format!("10.0.0.{i}/24"));
    }

    // Pause: in-band cancel, acknowledged by interrupted + done.
    let script = async {
        let cancel = router.read_sentence().await;
        assert_eq!(cancel.words()[0], "/cancel");
        assert_eq!(cancel.attribute("tag"), Some(tag.as_str()));
        let cancel_tag = cancel.tag().unwrap().to_owned();

        router
            .send(&[
                "!trap",
                "=category=2",
                "=message=interrupted",
                &format!(".tag={tag}"),
            ])
            .await;
        router.send(&["!done", &format!(".tag={tag}")]).await;
        router.send(&["!done", &format!(".tag={cancel_tag}")]).await;
        cancel_tag
    };
    let (paused, _) = tokio::join!(stream.pause(), script);
    paused.expect("pause should complete");

    // Resume re-issues the original request on the same tag.
    let script = async {
        let reissued = router.read_sentence().await;
        assert_eq!(reissued.words()[0], "/ip/address/listen");
        assert_eq!(reissued.tag(), Some(tag.as_str()));

        router
            .send(&["!re", "=address=10.0.0.9/24", &format!(".tag={tag}")])
            .await;
    };
    let (resumed, ()) = tokio::join!(stream.resume(), script);
    resumed.expect("resume should complete");

    let batch = stream.next().await.unwrap().unwrap();
    assert_eq!(batch[0]["address"], "10.0.0.9/24");

    // Stop is a cancel handshake too, and is idempotent afterwards.
    let script = async {
        let cancel = router.read_sentence().await;
        let cancel_tag = cancel.tag().unwrap().to_owned();
        router
            .send(&[
                "!trap",
                "=category=2",
                "=message=interrupted",
                &format!(".tag={tag}"),
            ])
            .await;
        router.send(&["!done", &format!(".tag={tag}")]).await;
        router.send(&["!done", &format!(".tag={cancel_tag}")]).await;
    };
    let (stopped, ()) = tokio::join!(stream.stop(), script);
    stopped.expect("stop should complete");

    assert!(stream.next().await.is_none());
    assert!(stream.stop().await.is_ok());
    assert!(matches!(stream.pause().await, Err(Error::StreamClosed)));
}

#[tokio::test]
async fn transport_loss_fails_stream_with_connection_lost() {
    let (api, mut router) = authenticated().await;

    let mut stream = api
        .stream(command_words("/tool/torch", &[("interface", "ether1")]))
        .unwrap();

    let request = router.read_sentence().await;
    let tag = request.tag().unwrap().to_owned();
    router
        .send(&["!re", "=tx=100", &format!(".tag={tag}")])
        .await;

    let batch = stream.next().await.unwrap().unwrap();
    assert_eq!(batch[0]["tx"], "100");

    // Reset: the router side goes away mid-stream.
    drop(router);

    match stream.next().await {
        Some(Err(Error::ConnectionLost)) => {}
        other => panic!("unexpected: {other:?}"),
    }
    assert!(stream.next().await.is_none());
    assert!(matches!(stream.pause().await, Err(Error::StreamClosed)));
}

#[tokio::test]
async fn transport_loss_fails_open_channel() {
    let (api, mut router) = authenticated().await;

    let channel = api.command(command_words("/system/resource/print", &[])).unwrap();
    router.read_sentence().await;
    drop(router);

    match channel.collect().await {
        Err(Error::ConnectionLost) => {}
        other => panic!("unexpected: {:?}", other.err()),
    }
}

#[tokio::test]
async fn writes_after_close_fail_with_not_connected() {
    let (mut api, router) = authenticated().await;
    let mut events = api.events().expect("events channel");

    drop(router);

    // Wait for the engine to notice the loss.
    loop {
        match events.recv().await.expect("close event") {
            ConnectionEvent::Close { .. } => break,
            _ => continue,
        }
    }

    match api.command(command_words("/interface/print", &[])) {
        Err(Error::NotConnected) => {}
        other => panic!("unexpected: {:?}", other.err()),
    }
}

#[tokio::test]
async fn unregistered_tag_is_reported_but_not_fatal() {
    let (mut api, mut router) = authenticated().await;
    let mut events = api.events().expect("events channel");

    router.send(&["!re", "=name=ghost", ".tag=zz"]).await;

    loop {
        match events.recv().await.expect("event") {
            ConnectionEvent::Error(Error::UnregisteredTag(tag)) => {
                assert_eq!(tag, "zz");
                break;
            }
            ConnectionEvent::Connected => continue,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // The connection is still usable afterwards.
    let channel = api.command(command_words("/interface/print", &[])).unwrap();
    let script = async {
        let request = router.read_sentence().await;
        let tag = request.tag().unwrap().to_owned();
        router.send(&["!done", &format!(".tag={tag}")]).await;
    };
    let (rows, ()) = tokio::join!(channel.collect(), script);
    assert!(rows.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sections_batch_on_change_and_quiescence() {
    let (api, mut router) = authenticated().await;

    let mut stream = api
        .stream(command_words("/tool/torch", &[("interface", "ether1")]))
        .unwrap();

    let request = router.read_sentence().await;
    let tag = request.tag().unwrap().to_owned();

    // Two rows of section 1, then section 2: the boundary flushes the
    // first snapshot without waiting for the timer.
    router
        .send(&["!re", "=tx=1", ".section=1", &format!(".tag={tag}")])
        .await;
    router
        .send(&["!re", "=tx=2", ".section=1", &format!(".tag={tag}")])
        .await;
    router
        .send(&["!re", "=tx=3", ".section=2", &format!(".tag={tag}")])
        .await;

    let snapshot = stream.next().await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0]["tx"], "1");
    assert_eq!(snapshot[1]["tx"], "2");

    // Section 2 never changes again; the quiescence timer delivers it.
    let snapshot = stream.next().await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0]["tx"], "3");
}

#[tokio::test(start_paused = true)]
async fn silent_interval_synthesizes_empty_batches()  {
    let (api, mut router) = authenticated().await;

    let mut stream = api
        .stream(command_words("/ip/firewall/connection/listen", &[("interval", "1")]))
        .unwrap();

    let request = router.read_sentence().await;
    assert_eq!(request.attribute("interval"), Some("1"));
    let tag = request.tag().unwrap().to_owned();

    // Nothing from the router: after interval + grace the engine reports
    // an empty tick so the consumer can tell silence from a stall.
    let batch = stream.next().await.unwrap().unwrap();
    assert!(batch.is_empty());

    // Data resets the debounce window.
    router
        .send(&["!re", "=dst-address=8.8.8.8", &format!(".tag={tag}")])
        .await;
    let batch = stream.next().await.unwrap().unwrap();
    assert_eq!(batch.len(), 1);

    let batch = stream.next().await.unwrap().unwrap();
    assert!(batch.is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_closes_the_connection() {
    let mut config = ApiConfig::new("test-router");
    config.idle_timeout_secs = Some(5);

    let (mut api, _router) = pipe_with(config);
    let mut events = api.events().expect("events channel");

    let mut saw_timeout = false;
    loop {
        match events.recv().await.expect("event") {
            ConnectionEvent::Timeout => saw_timeout = true,
            ConnectionEvent::Close { reason } => {
                assert_eq!(reason, "idle timeout");
                break;
            }
            _ => continue,
        }
    }
    assert!(saw_timeout);
}

#[tokio::test]
async fn fatal_from_router_tears_down_open_commands() {
    let (api, mut router) = authenticated().await;

    let channel = api.command(command_words("/interface/print", &[])).unwrap();
    router.read_sentence().await;

    router.send(&["!fatal", "session terminated"]).await;

    match channel.collect().await {
        Err(Error::ConnectionLost) => {}
        other => panic!("unexpected: {:?}", other.err()),
    }
}
