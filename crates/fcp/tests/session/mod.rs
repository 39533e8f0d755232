//! Session behavior against fake nodes

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fcp::{
    FcpCodec, Message, ProbeOutcome, ProbeRequest, ProbeResult, ProbeSession, ProbeType,
    ReconnectPolicy, ReconnectingClient, SessionConfig, SessionError, SessionObserver,
    SessionState,
};
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// The node side of an in-memory connection
struct FakeNode {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeNode {
    async fn recv(&mut self) -> Message {
        FcpCodec
            .read_message(&mut self.reader)
            .await
            .expect("read from client")
            .expect("client closed the connection")
    }

    async fn send(&mut self, message: Message) {
        FcpCodec.write_message(&mut self.writer, &message).await.expect("write to client");
    }

    /// Accept the client's hello and answer with `reply`
    async fn handshake(&mut self, reply: Message) {
        let hello = self.recv().await;
        assert_eq!(hello.name, "ClientHello");
        assert_eq!(hello.get("ExpectedVersion"), Some("2.0"));
        self.send(reply).await;
    }
}

fn pair() -> (DuplexStream, FakeNode) {
    let (client, node) = tokio::io::duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(node);
    (client, FakeNode { reader: BufReader::new(read_half), writer: write_half })
}

fn config() -> SessionConfig {
    SessionConfig {
        client_name: "fnprobe-test".to_string(),
        handshake_timeout: Duration::from_secs(5),
        response_timeout: Duration::from_secs(5),
    }
}

fn node_hello() -> Message {
    Message::new("NodeHello").with_field("FCPVersion", "2.0").with_field("Version", "Fred,0.7,1.0,1466")
}

async fn ready_session() -> (ProbeSession, FakeNode) {
    let (client, mut node) = pair();
    let (session, ()) = tokio::join!(ProbeSession::establish("fake", client, config()), async {
        node.handshake(node_hello()).await
    });
    (session.expect("handshake should succeed"), node)
}

#[tokio::test]
async fn test_handshake_and_single_probe() {
    let (session, mut node) = ready_session().await;
    assert_eq!(session.state(), SessionState::Ready);

    let request = ProbeRequest::new(ProbeType::Location, 25);
    let (outcome, ()) = tokio::join!(session.send(&request), async {
        let probe = node.recv().await;
        assert_eq!(probe.name, "ProbeRequest");
        assert_eq!(probe.get("Type"), Some("LOCATION"));
        assert_eq!(probe.get("HopsToLive"), Some("25"));
        let identifier = probe.identifier().expect("request carries an identifier").to_string();
        node.send(
            Message::new("ProbeLocation")
                .with_field("Identifier", identifier)
                .with_field("Location", "0.42"),
        )
        .await;
    });

    assert_eq!(
        outcome.unwrap(),
        ProbeOutcome::Result(ProbeResult::Location { location: 0.42 })
    );
    assert_eq!(session.in_flight(), 0);
}

#[tokio::test]
async fn test_protocol_error_during_handshake_is_fatal() {
    let (client, mut node) = pair();
    let refusal = Message::new("ProtocolError")
        .with_field("Code", 1)
        .with_field("CodeDescription", "ClientHello must be first message");

    let (result, ()) = tokio::join!(ProbeSession::establish("fake", client, config()), async {
        node.handshake(refusal).await
    });

    let err = result.err().expect("handshake should fail");
    assert!(matches!(err, SessionError::HandshakeIncompatible(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_closed_during_handshake_is_not_fatal() {
    let (client, mut node) = pair();

    let (result, ()) = tokio::join!(ProbeSession::establish("fake", client, config()), async {
        let _ = node.recv().await;
        drop(node);
    });

    let err = result.err().expect("handshake should fail");
    assert!(matches!(err, SessionError::TransportLost(_)));
    assert!(!err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_silent_node_times_out_handshake() {
    let (client, mut node) = pair();

    let (result, _hello) = tokio::join!(
        ProbeSession::establish("fake", client, config()),
        node.recv()
    );

    assert!(matches!(result.err(), Some(SessionError::HandshakeTimeout(_))));
}

#[tokio::test]
async fn test_concurrent_replies_are_correlated_out_of_order() {
    let (session, mut node) = ready_session().await;

    let build = ProbeRequest::new(ProbeType::Build, 10);
    let store = ProbeRequest::new(ProbeType::StoreSize, 10);
    let (build_outcome, store_outcome, ()) =
        tokio::join!(session.send(&build), session.send(&store), async {
            let first = node.recv().await;
            let second = node.recv().await;
            // Answer in reverse order of arrival.
            for probe in [second, first] {
                let identifier = probe.identifier().unwrap().to_string();
                let reply = match probe.get("Type") {
                    Some("BUILD") => Message::new("ProbeBuild").with_field("Build", 1466),
                    Some("STORE_SIZE") => Message::new("ProbeStoreSize").with_field("StoreSize", "20.5"),
                    other => panic!("unexpected probe type {other:?}"),
                };
                node.send(reply.with_field("Identifier", identifier)).await;
            }
        });

    assert_eq!(build_outcome.unwrap(), ProbeOutcome::Result(ProbeResult::Build { build: 1466 }));
    assert_eq!(
        store_outcome.unwrap(),
        ProbeOutcome::Result(ProbeResult::StoreSize { gib: 20.5 })
    );
}

#[tokio::test]
async fn test_disconnect_fails_pending_requests() {
    let (session, mut node) = ready_session().await;

    let request = ProbeRequest::new(ProbeType::Uptime48h, 30);
    let (outcome, ()) = tokio::join!(session.send(&request), async {
        let _ = node.recv().await;
        drop(node);
    });

    assert!(matches!(outcome, Err(SessionError::TransportLost(_))));
    assert_eq!(session.closed().await, "node closed the connection");
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.send(&request).await, Err(SessionError::NotReady)));
}

#[tokio::test]
async fn test_protocol_error_reply_is_fatal() {
    let (session, mut node) = ready_session().await;

    let request = ProbeRequest::new(ProbeType::Identifier, 40);
    let (outcome, ()) = tokio::join!(session.send(&request), async {
        let probe = node.recv().await;
        let identifier = probe.identifier().unwrap().to_string();
        node.send(
            Message::new("ProtocolError")
                .with_field("Identifier", identifier)
                .with_field("Code", 34)
                .with_field("CodeDescription", "Unknown message name"),
        )
        .await;
    });

    let err = outcome.unwrap_err();
    assert!(err.is_fatal(), "unexpected error {err:?}");
}

#[tokio::test]
async fn test_late_reply_after_cancellation_is_discarded() {
    let (session, mut node) = ready_session().await;

    let request = ProbeRequest::new(ProbeType::Location, 20);
    let abandoned = tokio::time::timeout(Duration::from_millis(50), session.send(&request)).await;
    assert!(abandoned.is_err());
    assert_eq!(session.in_flight(), 0);

    // The node answers the abandoned request, then the next one.
    let stale = node.recv().await;
    node.send(
        Message::new("ProbeLocation")
            .with_field("Identifier", stale.identifier().unwrap())
            .with_field("Location", "0.1"),
    )
    .await;

    let (outcome, ()) = tokio::join!(session.send(&request), async {
        let probe = node.recv().await;
        node.send(
            Message::new("ProbeLocation")
                .with_field("Identifier", probe.identifier().unwrap())
                .with_field("Location", "0.9"),
        )
        .await;
    });

    assert_eq!(outcome.unwrap(), ProbeOutcome::Result(ProbeResult::Location { location: 0.9 }));
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_close_says_goodbye() {
    let (session, mut node) = ready_session().await;

    session.close().await;

    assert_eq!(node.recv().await.name, "Disconnect");
    assert_eq!(session.closed().await, "closed locally");
}

/// Records lifecycle events in order
#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    async fn on_connected(&self, _session: Arc<ProbeSession>) {
        self.events.lock().unwrap().push("connected".to_string());
    }

    async fn on_disconnected(&self, _reason: &str) {
        self.events.lock().unwrap().push("disconnected".to_string());
    }

    async fn on_handshake_failed(&self, _error: &SessionError) {
        self.events.lock().unwrap().push("incompatible".to_string());
    }
}

async fn accept_and_greet(listener: &TcpListener, reply: Message) -> tokio::net::TcpStream {
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let hello = FcpCodec.read_message(&mut reader).await.unwrap().unwrap();
    assert_eq!(hello.name, "ClientHello");
    FcpCodec.write_message(&mut write_half, &reply).await.unwrap();
    reader.into_inner().reunite(write_half).unwrap()
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(50), 2.0).with_jitter(0.0)
}

#[tokio::test]
async fn test_reconnects_after_node_drops_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let observer = Arc::new(RecordingObserver::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let client = ReconnectingClient::new(endpoint, config(), fast_policy());
    let run = tokio::spawn(client.run(observer.clone(), shutdown_rx));

    let first = accept_and_greet(&listener, node_hello()).await;
    drop(first);
    let _second = accept_and_greet(&listener, node_hello()).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while observer.events().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("observer should see the reconnect");

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().expect("shutdown is not an error");

    assert_eq!(observer.events(), ["connected", "disconnected", "connected", "disconnected"]);
}

#[tokio::test]
async fn test_incompatible_node_stops_reconnecting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let observer = Arc::new(RecordingObserver::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let client = ReconnectingClient::new(endpoint, config(), fast_policy());
    let run = tokio::spawn(client.run(observer.clone(), shutdown_rx));

    let _stream = accept_and_greet(
        &listener,
        Message::new("ProtocolError").with_field("CodeDescription", "version mismatch"),
    )
    .await;

    let result = run.await.unwrap();
    assert!(matches!(result, Err(SessionError::HandshakeIncompatible(_))));
    assert_eq!(observer.events(), ["incompatible"]);
}

#[tokio::test]
async fn test_shutdown_while_waiting_to_retry() {
    // Nothing listens on this port once the listener is dropped.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);

    let observer = Arc::new(RecordingObserver::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let policy = ReconnectPolicy::new(Duration::from_secs(60), Duration::from_secs(60), 2.0);
    let client = ReconnectingClient::new(endpoint, config(), policy);
    let run = tokio::spawn(client.run(observer.clone(), shutdown_rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run).await.expect("run should stop");
    assert!(result.unwrap().is_ok());
    assert!(observer.events().is_empty());
}

async fn wait_for_state(states: &mut watch::Receiver<SessionState>, wanted: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("client never reached {wanted}"))
        .expect("client dropped its state");
}

#[tokio::test]
async fn test_client_publishes_session_states() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let observer = Arc::new(RecordingObserver::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Long enough to observe the gap between sessions.
    let policy = ReconnectPolicy::new(Duration::from_secs(2), Duration::from_secs(2), 1.0)
        .with_jitter(0.0);

    let client = ReconnectingClient::new(endpoint, config(), policy);
    let mut states = client.subscribe();
    assert_eq!(*states.borrow(), SessionState::Disconnected);
    let run = tokio::spawn(client.run(observer.clone(), shutdown_rx));

    // Connected but not yet greeted.
    let (stream, _) = listener.accept().await.unwrap();
    wait_for_state(&mut states, SessionState::AwaitingHandshake).await;
    assert!(observer.events().is_empty());

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let hello = FcpCodec.read_message(&mut reader).await.unwrap().unwrap();
    assert_eq!(hello.name, "ClientHello");
    FcpCodec.write_message(&mut write_half, &node_hello()).await.unwrap();
    wait_for_state(&mut states, SessionState::Ready).await;

    drop(reader);
    drop(write_half);
    wait_for_state(&mut states, SessionState::Disconnected).await;

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().expect("shutdown is not an error");
    assert_eq!(*states.borrow(), SessionState::Disconnected);
    assert_eq!(observer.events(), ["connected", "disconnected"]);
}
