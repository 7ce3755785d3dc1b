//! Transport-level integration tests over the in-memory relay bus

mod harness;

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use harness::{expect_stream, init_tracing, spawn_transport, wait_for, RelayBus};
use relaylink_peer::{
    Message, MessageHeader, MessagePayload, PeerInfo, RpcOptions, Sdp, SdpKind, Signal,
    SignalData, StreamEvent, TransportEvent,
};

fn rpc_opts() -> RpcOptions {
    RpcOptions {
        timeout: Duration::from_secs(1),
        cancel: CancellationToken::new(),
    }
}

fn test_signal(n: u32) -> Signal {
    Signal {
        generation_counter: 0,
        data: SignalData::Sdp(Sdp {
            kind: SdpKind::Offer,
            sdp: format!("v=0\r\ntest-{}", n),
        }),
    }
}

#[tokio::test]
async fn test_connect_rendezvous_opens_one_stream_each_side() {
    init_tracing();
    let bus = RelayBus::new();
    let a = spawn_transport(&bus, "peerA", 100);
    let b = spawn_transport(&bus, "peerB", 200);
    let mut a_events = a.events().unwrap();
    let mut b_events = b.events().unwrap();

    let cancel = CancellationToken::new();
    let connect = {
        let a = a.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { a.connect("default", "peerB", &cancel).await })
    };

    // the discovery join opens B's stream towards A
    let b_stream = expect_stream(&mut b_events).await;
    assert_eq!(b_stream.other().peer_id, "peerA");
    assert_eq!(b_stream.other().conn_id, 100);

    // B's reply materializes A's stream and completes connect()
    b_stream.send(MessagePayload::Join, true).await.unwrap();

    let a_stream = expect_stream(&mut a_events).await;
    assert_eq!(a_stream.other().peer_id, "peerB");
    assert_eq!(a_stream.other().conn_id, 200);

    timeout(Duration::from_secs(5), connect)
        .await
        .expect("connect did not finish")
        .unwrap();

    // the repeated joins from the rendezvous loop never open a second
    // stream on either side
    assert!(timeout(Duration::from_millis(300), b_events.recv())
        .await
        .is_err());
    assert!(timeout(Duration::from_millis(300), a_events.recv())
        .await
        .is_err());

    a.close(None).await;
    b.close(None).await;
}

#[tokio::test]
async fn test_duplicate_delivery_yields_exactly_one_signal() {
    init_tracing();
    let bus = RelayBus::new();
    // an at-least-once relay may retransmit anything
    bus.set_duplicate_delivery(true);

    let a = spawn_transport(&bus, "peerA", 100);
    let b = spawn_transport(&bus, "peerB", 200);
    let mut a_events = a.events().unwrap();
    let mut b_events = b.events().unwrap();

    let cancel = CancellationToken::new();
    {
        let a = a.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { a.connect("default", "peerB", &cancel).await });
    }

    let b_stream = expect_stream(&mut b_events).await;
    b_stream.send(MessagePayload::Join, true).await.unwrap();
    let a_stream = expect_stream(&mut a_events).await;
    let mut a_signals = a_stream.events().unwrap();

    let signal = test_signal(1);
    b_stream
        .send(MessagePayload::Signal(signal.clone()), true)
        .await
        .unwrap();

    // delivered twice by the bus, surfaced once by the queue
    match timeout(Duration::from_secs(2), a_signals.recv())
        .await
        .unwrap()
        .unwrap()
    {
        StreamEvent::Signal(received) => assert_eq!(received, signal),
        other => panic!("expected a signal, got {:?}", other),
    }
    assert!(timeout(Duration::from_millis(300), a_signals.recv())
        .await
        .is_err());

    a.close(None).await;
    b.close(None).await;
}

#[tokio::test]
async fn test_loopback_messages_never_create_streams() {
    init_tracing();
    let bus = RelayBus::new();
    let a = spawn_transport(&bus, "peerA", 100);
    let mut a_events = a.events().unwrap();

    // forged message from another incarnation of peerA to this one
    let client = bus.client();
    client
        .send(
            Message {
                header: Some(MessageHeader {
                    src: PeerInfo {
                        group_id: "default".to_string(),
                        peer_id: "peerA".to_string(),
                        conn_id: 999,
                    },
                    dst: a.info().clone(),
                    seqnum: 0,
                    reliable: false,
                }),
                payload: Some(MessagePayload::Join),
            },
            rpc_opts(),
        )
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(500), a_events.recv())
        .await
        .is_err());

    a.close(None).await;
}

#[tokio::test]
async fn test_messages_for_a_dead_conn_id_are_ignored() {
    init_tracing();
    let bus = RelayBus::new();
    let a = spawn_transport(&bus, "peerA", 100);
    let mut a_events = a.events().unwrap();
    let client = bus.client();

    let from_c = |dst_conn_id: u32| Message {
        header: Some(MessageHeader {
            src: PeerInfo {
                group_id: "default".to_string(),
                peer_id: "peerC".to_string(),
                conn_id: 300,
            },
            dst: PeerInfo {
                group_id: "default".to_string(),
                peer_id: "peerA".to_string(),
                conn_id: dst_conn_id,
            },
            seqnum: 0,
            reliable: false,
        }),
        payload: Some(MessagePayload::Join),
    };

    // addressed to a previous incarnation of peerA: silently ignored
    client.send(from_c(999), rpc_opts()).await.unwrap();
    assert!(timeout(Duration::from_millis(500), a_events.recv())
        .await
        .is_err());

    // addressed to the live conn id: stream opens
    client.send(from_c(100), rpc_opts()).await.unwrap();
    let stream = expect_stream(&mut a_events).await;
    assert_eq!(stream.other().peer_id, "peerC");

    a.close(None).await;
}

#[tokio::test]
async fn test_close_sends_exactly_one_bye() {
    init_tracing();
    let bus = RelayBus::new();
    let a = spawn_transport(&bus, "peerA", 100);
    let b = spawn_transport(&bus, "peerB", 200);
    let mut a_events = a.events().unwrap();
    let mut b_events = b.events().unwrap();

    let cancel = CancellationToken::new();
    {
        let a = a.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { a.connect("default", "peerB", &cancel).await });
    }

    let b_stream = expect_stream(&mut b_events).await;
    b_stream.send(MessagePayload::Join, true).await.unwrap();
    let a_stream = expect_stream(&mut a_events).await;
    let mut b_signals = b_stream.events().unwrap();

    // closing twice still produces a single bye on the wire
    a_stream.close(None).await;
    a_stream.close(None).await;

    let byes = bus
        .sent_by("peerA")
        .into_iter()
        .filter(|m| matches!(m.payload, Some(MessagePayload::Bye)))
        .count();
    assert_eq!(byes, 1);

    // the remote stream closes without echoing a bye back
    match timeout(Duration::from_secs(2), b_signals.recv())
        .await
        .unwrap()
        .unwrap()
    {
        StreamEvent::Closed(_) => {}
        other => panic!("expected close, got {:?}", other),
    }
    wait_for(|| b_stream.is_closed()).await;

    let b_byes = bus
        .sent_by("peerB")
        .into_iter()
        .filter(|m| matches!(m.payload, Some(MessagePayload::Bye)))
        .count();
    assert_eq!(b_byes, 0);

    a.close(None).await;
    b.close(None).await;
}

#[tokio::test]
async fn test_fatal_send_error_force_closes_the_transport() {
    init_tracing();
    let bus = RelayBus::new();
    let a = spawn_transport(&bus, "peerA", 100);
    let mut a_events = a.events().unwrap();

    bus.set_fail_sends(true);

    // the rendezvous join hits the fatal send and the whole transport goes
    let cancel = CancellationToken::new();
    a.connect("default", "peerB", &cancel).await;

    match timeout(Duration::from_secs(5), a_events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        TransportEvent::Closed(reason) => assert!(reason.contains("send")),
        other => panic!("expected transport close, got {:?}", other),
    }
    wait_for(|| a.is_closed()).await;
}

#[tokio::test]
async fn test_transport_close_closes_streams_and_is_idempotent() {
    init_tracing();
    let bus = RelayBus::new();
    let a = spawn_transport(&bus, "peerA", 100);
    let b = spawn_transport(&bus, "peerB", 200);
    let mut a_events = a.events().unwrap();
    let mut b_events = b.events().unwrap();

    let cancel = CancellationToken::new();
    {
        let a = a.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { a.connect("default", "peerB", &cancel).await });
    }

    let b_stream = expect_stream(&mut b_events).await;
    b_stream.send(MessagePayload::Join, true).await.unwrap();
    let a_stream = expect_stream(&mut a_events).await;

    a.close(Some("shutting down")).await;
    assert!(a_stream.is_closed());
    assert!(a.is_closed());

    match timeout(Duration::from_secs(2), a_events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        TransportEvent::Closed(reason) => assert_eq!(reason, "shutting down"),
        other => panic!("expected transport close, got {:?}", other),
    }

    // idempotent: no second close event
    a.close(None).await;
    assert!(timeout(Duration::from_millis(300), a_events.recv())
        .await
        .is_err());

    b.close(None).await;
}
