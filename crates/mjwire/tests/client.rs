//! Integration tests for the client against an in-memory server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mjwire::prelude::*;
use mjwire::protocol::{
    ActionPrototype, CorrelationId, Envelope, FrameHeader, decode_frame,
    encode_frame, obfuscate,
};
use mjwire::transport::{MemoryPeer, MemoryServer};
use prost::Message;
use tokio::sync::mpsc;

// =========================================================================
// Test messages and server helpers
// =========================================================================

#[derive(Clone, PartialEq, Message)]
struct Echo {
    #[prost(string, tag = "1")]
    text: String,
}

#[derive(Clone, PartialEq, Message)]
struct NotifyChat {
    #[prost(string, tag = "1")]
    text: String,
}

#[derive(Clone, PartialEq, Message)]
struct ActionDiscardTile {
    #[prost(uint32, tag = "1")]
    seat: u32,
    #[prost(string, tag = "2")]
    tile: String,
}

const WAIT: Duration = Duration::from_secs(5);

fn echo(text: &str) -> Echo {
    Echo { text: text.into() }
}

/// Reads the next Request frame the client wrote.
async fn next_request(peer: &MemoryPeer) -> (CorrelationId, String, Echo) {
    let bytes = tokio::time::timeout(WAIT, peer.recv())
        .await
        .expect("no request within timeout")
        .expect("client hung up");
    let frame = decode_frame(&bytes).unwrap();
    let FrameHeader::Request(id) = frame.header else {
        panic!("expected a request, got {:?}", frame.header);
    };
    let envelope = Envelope::parse(frame.envelope).unwrap();
    let body = envelope.open::<Echo>().unwrap();
    (id, envelope.name, body)
}

fn response(id: CorrelationId, body: &impl Message) -> Vec<u8> {
    let envelope = Envelope::wrap("", body).encode_to_vec();
    encode_frame(FrameHeader::Response(id), &envelope)
}

fn notify(name: &str, body: &impl Message) -> Vec<u8> {
    let envelope = Envelope::wrap(name, body).encode_to_vec();
    encode_frame(FrameHeader::Notify, &envelope)
}

async fn accept(server: &MemoryServer) -> MemoryPeer {
    tokio::time::timeout(WAIT, server.accept())
        .await
        .expect("no dial within timeout")
        .expect("connector dropped")
}

async fn wait_for_state(client: &Client<MemoryConnector>, state: ConnectionState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("state not reached within timeout")
        .expect("state sender dropped");
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        delay_ms: 20,
        ..ReconnectConfig::default()
    }
}

async fn connected(
    builder: ClientBuilder,
) -> (Client<MemoryConnector>, MemoryServer, MemoryPeer) {
    let (connector, server) = MemoryConnector::pair();
    let client = builder.build(connector).unwrap();
    client.connect("mem://lobby").await.unwrap();
    let peer = accept(&server).await;
    (client, server, peer)
}

// =========================================================================
// Calls
// =========================================================================

#[tokio::test]
async fn test_call_round_trip() {
    let (client, _server, peer) = connected(ClientBuilder::new()).await;
    assert_eq!(client.state(), ConnectionState::Connected);

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller.call::<Echo, Echo>(".lq.Lobby.echo", &echo("hello")).await
    });

    let (id, api, body) = next_request(&peer).await;
    assert_eq!(api, ".lq.Lobby.echo");
    assert_eq!(body.text, "hello");
    peer.send(response(id, &echo("HELLO")));

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.text, "HELLO");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_calls_never_cross_talk() {
    let (client, _server, peer) = connected(ClientBuilder::new()).await;

    let calls: Vec<_> = (0..200)
        .map(|n| {
            let caller = client.clone();
            tokio::spawn(async move {
                let text = format!("call-{n}");
                let reply = caller
                    .call::<Echo, Echo>(".lq.Lobby.echo", &echo(&text))
                    .await
                    .unwrap();
                (text, reply.text)
            })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..200 {
        requests.push(next_request(&peer).await);
    }
    // Answer in reverse order of arrival.
    for (id, _, body) in requests.into_iter().rev() {
        peer.send(response(id, &body));
    }

    for call in calls {
        let (sent, got) = call.await.unwrap();
        assert_eq!(sent, got);
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_cancelled_call_drops_late_response() {
    let (client, _server, peer) = connected(ClientBuilder::new()).await;

    let (handle, token) = cancellation();
    let caller = client.clone();
    let call = tokio::spawn(async move {
        let ctx = CallContext::new().cancellable(token);
        caller.call_with::<Echo, Echo>("slow", &echo("a"), &ctx).await
    });

    let (late_id, _, _) = next_request(&peer).await;
    handle.cancel();
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Cancelled));
    assert_eq!(client.pending_calls(), 0);

    // The late answer arrives, then a fresh call must still get its own.
    peer.send(response(late_id, &echo("late")));
    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller.call::<Echo, Echo>("fast", &echo("b")).await
    });
    let (id, _, _) = next_request(&peer).await;
    assert_ne!(id, late_id);
    peer.send(response(id, &echo("fresh")));
    assert_eq!(call.await.unwrap().unwrap().text, "fresh");
}

#[tokio::test]
async fn test_call_times_out() {
    let (client, _server, peer) = connected(ClientBuilder::new()).await;

    let ctx = CallContext::with_timeout(Duration::from_millis(50));
    let err = client
        .call_with::<Echo, Echo>("never", &echo("x"), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Timeout));
    assert_eq!(client.pending_calls(), 0);

    // The request was still written.
    let (_, api, _) = next_request(&peer).await;
    assert_eq!(api, "never");
}

#[tokio::test]
async fn test_wrong_response_schema_is_decode_error() {
    let (client, _server, peer) = connected(ClientBuilder::new()).await;

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller.call::<Echo, Echo>("typed", &echo("x")).await
    });
    let (id, _, _) = next_request(&peer).await;
    // Field 1 with wire type varint where Echo expects a string.
    let bad = encode_frame(
        FrameHeader::Response(id),
        &Envelope::new("", vec![0x08, 0x01]).encode_to_vec(),
    );
    peer.send(bad);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Decode(_)));
}

// =========================================================================
// Push events
// =========================================================================

#[tokio::test]
async fn test_unknown_and_malformed_notifies_do_not_stop_the_loop() {
    let (client, _server, peer) = connected(ClientBuilder::new()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .on_notify::<NotifyChat, _>(".lq.NotifyChat", move |n| {
            let _ = tx.send(n.text.clone());
        })
        .unwrap();

    peer.send(notify("NotifyFoo", &echo("ignored")));
    peer.send(vec![9, 9, 9]);
    peer.send(vec![]);
    peer.send(notify(".lq.NotifyChat", &NotifyChat { text: "hi".into() }));

    let text = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(text, "hi");
    assert!(rx.try_recv().is_err());

    // Calls still work on the same link.
    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller.call::<Echo, Echo>("after", &echo("x")).await
    });
    let (id, _, _) = next_request(&peer).await;
    peer.send(response(id, &echo("ok")));
    assert_eq!(call.await.unwrap().unwrap().text, "ok");
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_actions_are_deobfuscated_and_routed() {
    let (client, _server, peer) =
        connected(ClientBuilder::new().subscriber_capacity(16)).await;
    let mut events = client.notifications().unwrap();
    assert!(client.notifications().is_none());

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .on_action::<ActionDiscardTile, _>("ActionDiscardTile", move |a| {
            let _ = tx.send((a.seat, a.tile.clone()));
        })
        .unwrap();

    let action = ActionDiscardTile {
        seat: 1,
        tile: "7p".into(),
    };
    let prototype = ActionPrototype {
        step: 12,
        name: "ActionDiscardTile".into(),
        data: obfuscate(&action.encode_to_vec()),
    };
    peer.send(notify(".lq.ActionPrototype", &prototype));

    let routed = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(routed, (1, "7p".to_string()));

    let first = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(first, PushEvent::Notify(_)));
    assert_eq!(first.name(), ".lq.ActionPrototype");

    let second = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    let PushEvent::Action(event) = second else {
        panic!("expected an action");
    };
    assert_eq!(event.step, 12);
    assert_eq!(event.downcast_ref::<ActionDiscardTile>(), Some(&action));
}

#[tokio::test]
async fn test_duplicate_handler_is_rejected() {
    let (connector, _server) = MemoryConnector::pair();
    let client = ClientBuilder::new().build(connector).unwrap();

    client
        .on_notify::<NotifyChat, _>(".lq.NotifyChat", |_| {})
        .unwrap();
    let err = client
        .on_notify::<NotifyChat, _>(".lq.NotifyChat", |_| {})
        .unwrap_err();
    assert!(matches!(err, DispatchError::DuplicateHandler(_)));

    // Action names live in their own catalog.
    client
        .on_action::<NotifyChat, _>(".lq.NotifyChat", |_| {})
        .unwrap();
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn test_disconnect_fails_pending_and_resumes_once_before_new_calls() {
    let (client, server, peer) =
        connected(ClientBuilder::new().reconnect(fast_reconnect())).await;

    let resumes = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&resumes);
    client.on_reconnect(move |resumer: Resumer<MemoryConnector>| {
        let counter = Arc::clone(&counter);
        async move {
            *counter.lock().unwrap() += 1;
            let _: Echo = resumer.call(".lq.Lobby.oauth2Login", &echo("token")).await?;
            Ok(())
        }
    });

    let calls: Vec<_> = (0..3)
        .map(|n| {
            let caller = client.clone();
            tokio::spawn(async move {
                caller
                    .call::<Echo, Echo>("inflight", &echo(&n.to_string()))
                    .await
            })
        })
        .collect();
    for _ in 0..3 {
        next_request(&peer).await;
    }
    assert_eq!(client.pending_calls(), 3);

    peer.fail("connection reset");
    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::ConnectionLost));
    }
    assert_eq!(client.pending_calls(), 0);

    // Issued while the client is reconnecting: must wait for resumption.
    let caller = client.clone();
    let after = tokio::spawn(async move {
        caller.call::<Echo, Echo>("after", &echo("x")).await
    });

    let peer = accept(&server).await;
    let (login_id, api, _) = next_request(&peer).await;
    assert_eq!(api, ".lq.Lobby.oauth2Login");
    assert_eq!(client.state(), ConnectionState::Connecting);
    peer.send(response(login_id, &echo("welcome")));

    let (id, api, _) = next_request(&peer).await;
    assert_eq!(api, "after");
    peer.send(response(id, &echo("done")));
    assert_eq!(after.await.unwrap().unwrap().text, "done");

    assert_eq!(*resumes.lock().unwrap(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_failed_resumption_still_reconnects() {
    let (client, server, peer) =
        connected(ClientBuilder::new().reconnect(fast_reconnect())).await;
    client.on_reconnect(|_resumer: Resumer<MemoryConnector>| async {
        Err::<(), BoxError>("login rejected".into())
    });

    peer.fail("reset");
    let _peer = accept(&server).await;
    wait_for_state(&client, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_redial_retries_until_server_accepts() {
    let (client, server, peer) =
        connected(ClientBuilder::new().reconnect(fast_reconnect())).await;

    server.refuse_next(2);
    peer.fail("reset");

    let peer = accept(&server).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller.call::<Echo, Echo>("again", &echo("x")).await
    });
    let (id, _, _) = next_request(&peer).await;
    peer.send(response(id, &echo("back")));
    assert_eq!(call.await.unwrap().unwrap().text, "back");
}

#[tokio::test]
async fn test_remote_close_does_not_reconnect_by_default() {
    let (client, _server, peer) =
        connected(ClientBuilder::new().reconnect(fast_reconnect())).await;

    peer.close();
    wait_for_state(&client, ConnectionState::Disconnected).await;

    let err = client
        .call::<Echo, Echo>("nobody", &echo("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotConnected));
}

#[tokio::test]
async fn test_remote_close_reconnects_when_enabled() {
    let reconnect = ReconnectConfig {
        on_remote_close: true,
        ..fast_reconnect()
    };
    let (client, server, peer) =
        connected(ClientBuilder::new().reconnect(reconnect)).await;

    peer.close();
    let _peer = accept(&server).await;
    wait_for_state(&client, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_explicit_connect_after_remote_close_keeps_handlers() {
    let (client, server, peer) = connected(ClientBuilder::new()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .on_notify::<NotifyChat, _>(".lq.NotifyChat", move |n| {
            let _ = tx.send(n.text.clone());
        })
        .unwrap();

    peer.close();
    wait_for_state(&client, ConnectionState::Disconnected).await;

    client.connect("mem://lobby").await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    let peer = accept(&server).await;

    peer.send(notify(".lq.NotifyChat", &NotifyChat { text: "again".into() }));
    let text = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(text, "again");

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller.call::<Echo, Echo>("after", &echo("x")).await
    });
    let (id, _, _) = next_request(&peer).await;
    peer.send(response(id, &echo("ok")));
    assert_eq!(call.await.unwrap().unwrap().text, "ok");

    // The new lifecycle is running, so a second connect is refused.
    let err = client.connect("mem://lobby").await.unwrap_err();
    assert!(matches!(err, MjwireError::AlreadyConnected));
}

#[tokio::test]
async fn test_explicit_connect_after_failure_with_reconnect_disabled() {
    let reconnect = ReconnectConfig {
        enabled: false,
        ..ReconnectConfig::default()
    };
    let (client, server, peer) =
        connected(ClientBuilder::new().reconnect(reconnect)).await;

    peer.fail("reset");
    wait_for_state(&client, ConnectionState::Disconnected).await;
    let err = client.call::<Echo, Echo>("x", &echo("x")).await.unwrap_err();
    assert!(matches!(err, CallError::NotConnected));

    client.connect("mem://lobby").await.unwrap();
    let _peer = accept(&server).await;
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_untaken_subscriber_queue_does_not_block_calls() {
    let config = ClientConfig {
        subscriber_capacity: 1,
        queue_capacity: 1,
        overflow_warn_ms: 50,
        ..ClientConfig::default()
    };
    let (client, _server, peer) = connected(ClientBuilder::new().config(config)).await;
    client
        .register_notify::<NotifyChat>(".lq.NotifyChat")
        .unwrap();

    for n in 0..6 {
        peer.send(notify(".lq.NotifyChat", &NotifyChat { text: n.to_string() }));
    }

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller.call::<Echo, Echo>("after", &echo("x")).await
    });
    let (id, _, _) = next_request(&peer).await;
    peer.send(response(id, &echo("ok")));
    assert_eq!(call.await.unwrap().unwrap().text, "ok");
    assert_eq!(client.queue_stalls(), 0);

    // Taking the queue starts the copy from then on.
    let mut events = client.notifications().unwrap();
    peer.send(notify(".lq.NotifyChat", &NotifyChat { text: "live".into() }));
    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.downcast_ref::<NotifyChat>().unwrap().text, "live");
}

#[tokio::test]
async fn test_first_connect_failure_is_returned() {
    let (connector, server) = MemoryConnector::pair();
    server.refuse_next(1);
    let client = ClientBuilder::new().build(connector).unwrap();

    let err = client.connect("mem://lobby").await.unwrap_err();
    assert!(matches!(err, MjwireError::Transport(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.call::<Echo, Echo>("x", &echo("x")).await.unwrap_err();
    assert!(matches!(err, CallError::NotConnected));

    // A later explicit connect may succeed.
    client.connect("mem://lobby").await.unwrap();
    let err = client.connect("mem://lobby").await.unwrap_err();
    assert!(matches!(err, MjwireError::AlreadyConnected));
}

#[tokio::test]
async fn test_close_is_idempotent_and_terminal() {
    let (client, _server, peer) = connected(ClientBuilder::new()).await;

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller.call::<Echo, Echo>("pending", &echo("x")).await
    });
    next_request(&peer).await;

    client.close().await;
    client.close().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Closed));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.call::<Echo, Echo>("late", &echo("x")).await.unwrap_err();
    assert!(matches!(err, CallError::Closed));
    let err = client.connect("mem://lobby").await.unwrap_err();
    assert!(matches!(err, MjwireError::Call(CallError::Closed)));
}

#[tokio::test]
async fn test_close_ends_subscriber_stream() {
    let (client, _server, _peer) =
        connected(ClientBuilder::new().subscriber_capacity(4)).await;
    let mut events = client.notifications().unwrap();

    client.close().await;
    let end = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_keepalive_drops_silent_link() {
    let keepalive = KeepaliveConfig {
        api: ".lq.Lobby.heatbeat".into(),
        interval_ms: 100,
        max_missed: 2,
    };
    let (client, server, peer) = connected(
        ClientBuilder::new()
            .keepalive(keepalive)
            .reconnect(fast_reconnect()),
    )
    .await;

    // Two heartbeats go unanswered.
    let (_, api, _) = next_request(&peer).await;
    assert_eq!(api, ".lq.Lobby.heatbeat");
    next_request(&peer).await;

    // The link is dropped and a new one dialed.
    let peer = accept(&server).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    // Answered heartbeats keep the new link up.
    let (id, api, _) = next_request(&peer).await;
    assert_eq!(api, ".lq.Lobby.heatbeat");
    peer.send(response(id, &Echo::default()));
    client.close().await;
}
