//! End-to-end shard behavior against an in-process gateway server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lowcord::dispatcher::HandlerResult;
use lowcord::gateway::GatewayError;
use lowcord::{
    HttpConfig, HttpEngine, Shard, ShardEvent, ShardManager, ShardManagerOptions, ShardState,
    TimesPerWindow,
};

type ServerWs = WebSocketStream<TcpStream>;

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

fn text_frame(value: &Value) -> Message {
    Message::Text(value.to_string().into())
}

fn hello(interval_ms: u64) -> Message {
    text_frame(&json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}))
}

fn dispatch(seq: u64, name: &str, data: Value) -> Message {
    text_frame(&json!({"op": 0, "s": seq, "t": name, "d": data}))
}

fn ready(addr: SocketAddr, session_id: &str) -> Message {
    dispatch(
        1,
        "READY",
        json!({
            "v": 10,
            "session_id": session_id,
            "resume_gateway_url": format!("ws://{addr}"),
        }),
    )
}

fn close_frame(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "test".to_owned().into(),
    }))
}

/// Read client frames until a JSON payload arrives; `None` on close.
async fn next_json(ws: &mut ServerWs) -> Option<Value> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

/// Read client frames until a close frame arrives, returning its code.
async fn next_close_code(ws: &mut ServerWs) -> Option<u16> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

fn test_shard(addr: SocketAddr) -> Shard {
    let options = ShardManagerOptions {
        token: "test-token".into(),
        intents: 512,
        ..ShardManagerOptions::default()
    };
    Shard::new(
        0,
        1,
        format!("ws://{addr}"),
        &options,
        Arc::new(TimesPerWindow::new(16, Duration::from_secs(1))),
    )
}

async fn wait_for_state(shard: &Shard, state: ShardState) {
    timeout(Duration::from_secs(5), async {
        loop {
            if shard.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {state:?}, stuck in {:?}", shard.state()));
}

/// Record every state the shard enters.
fn record_states(shard: &Shard) -> Arc<Mutex<Vec<ShardState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    shard.dispatcher().add_listener("state_change".to_owned(), {
        let states = Arc::clone(&states);
        move |event| {
            let states = Arc::clone(&states);
            async move {
                if let ShardEvent::StateChange { to, .. } = event {
                    states.lock().unwrap().push(to);
                }
                HandlerResult::Ok(())
            }
        }
    });
    states
}

#[tokio::test]
async fn identifies_and_reaches_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);
    shard.connect().unwrap();

    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();

    let identify = next_json(&mut ws).await.unwrap();
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], "test-token");
    assert_eq!(identify["d"]["intents"], 512);
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(identify["d"]["compress"], false);
    assert_eq!(identify["d"]["properties"]["browser"], "lowcord");

    ws.send(ready(addr, "sess-1")).await.unwrap();
    wait_for_state(&shard, ShardState::Connected).await;
    assert_eq!(shard.session_id().as_deref(), Some("sess-1"));
    assert_eq!(shard.sequence(), Some(1));
}

#[tokio::test]
async fn dispatch_events_reach_the_event_dispatcher() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);

    let waiting = tokio::spawn({
        let dispatcher = shard.event_dispatcher().clone();
        async move {
            dispatcher
                .wait_for("MESSAGE_CREATE".to_owned(), |data| data["id"] == "42")
                .await
                .unwrap()
        }
    });
    tokio::task::yield_now().await;

    shard.connect().unwrap();
    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    next_json(&mut ws).await.unwrap();
    ws.send(ready(addr, "sess-1")).await.unwrap();
    ws.send(dispatch(2, "MESSAGE_CREATE", json!({"id": "42", "content": "hi"})))
        .await
        .unwrap();

    let data = timeout(Duration::from_secs(5), waiting).await.unwrap().unwrap();
    assert_eq!(data["content"], "hi");
}

#[tokio::test]
async fn speaks_zlib_stream_transport_compression() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);
    shard.connect().unwrap();

    let mut ws = accept(&listener).await;
    let mut deflate = Compress::new(Compression::default(), true);
    let mut compressed = |value: &Value| {
        let bytes = value.to_string().into_bytes();
        let mut out = Vec::with_capacity(bytes.len() + 512);
        deflate
            .compress_vec(&bytes, &mut out, FlushCompress::Sync)
            .unwrap();
        Message::Binary(out.into())
    };

    ws.send(compressed(
        &json!({"op": 10, "d": {"heartbeat_interval": 60_000}}),
    ))
    .await
    .unwrap();
    let identify = next_json(&mut ws).await.unwrap();
    assert_eq!(identify["op"], 2);

    ws.send(compressed(&json!({
        "op": 0,
        "s": 1,
        "t": "READY",
        "d": {"v": 10, "session_id": "sess-z", "resume_gateway_url": format!("ws://{addr}")},
    })))
    .await
    .unwrap();

    wait_for_state(&shard, ShardState::Connected).await;
    assert_eq!(shard.session_id().as_deref(), Some("sess-z"));
}

#[tokio::test]
async fn sequence_is_monotonically_nondecreasing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);
    shard.connect().unwrap();

    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    next_json(&mut ws).await.unwrap();
    ws.send(ready(addr, "sess-1")).await.unwrap();
    wait_for_state(&shard, ShardState::Connected).await;

    ws.send(dispatch(5, "MESSAGE_CREATE", json!({}))).await.unwrap();
    ws.send(dispatch(3, "MESSAGE_CREATE", json!({}))).await.unwrap();
    ws.send(dispatch(6, "MESSAGE_CREATE", json!({}))).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while shard.sequence() != Some(6) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(shard.sequence(), Some(6));
}

#[tokio::test]
async fn resumes_after_a_transient_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);
    let states = record_states(&shard);
    shard.connect().unwrap();

    // First connection: fresh identify.
    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    let first = next_json(&mut ws).await.unwrap();
    assert_eq!(first["op"], 2);
    ws.send(ready(addr, "sess-r")).await.unwrap();
    ws.send(dispatch(42, "MESSAGE_CREATE", json!({}))).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while shard.sequence() != Some(42) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Kick the connection with a recoverable close code.
    ws.send(close_frame(4000)).await.unwrap();
    drop(ws);

    // Second connection: the shard must RESUME, not re-identify.
    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    let resume = next_json(&mut ws).await.unwrap();
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "sess-r");
    assert_eq!(resume["d"]["seq"], 42);
    assert_eq!(resume["d"]["token"], "test-token");

    ws.send(dispatch(43, "RESUMED", json!({}))).await.unwrap();
    wait_for_state(&shard, ShardState::Connected).await;
    assert_eq!(shard.session_id().as_deref(), Some("sess-r"));

    let states = states.lock().unwrap().clone();
    assert!(states.contains(&ShardState::Reconnecting), "{states:?}");
    assert!(states.contains(&ShardState::Resuming), "{states:?}");
    assert_eq!(
        states.iter().filter(|s| **s == ShardState::Connected).count(),
        2,
        "{states:?}"
    );
}

#[tokio::test]
async fn non_resumable_invalidation_clears_the_session_and_reidentifies() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);
    shard.connect().unwrap();

    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    next_json(&mut ws).await.unwrap();
    ws.send(ready(addr, "sess-i")).await.unwrap();
    wait_for_state(&shard, ShardState::Connected).await;

    // Session invalidated, not resumable.
    ws.send(text_frame(&json!({"op": 9, "d": false}))).await.unwrap();
    assert_eq!(next_close_code(&mut ws).await, Some(4000));
    drop(ws);

    // The shard must come back with a fresh IDENTIFY.
    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    let identify = next_json(&mut ws).await.unwrap();
    assert_eq!(identify["op"], 2);
    assert!(identify["d"]["session_id"].is_null());

    ws.send(ready(addr, "sess-new")).await.unwrap();
    wait_for_state(&shard, ShardState::Connected).await;
    assert_eq!(shard.session_id().as_deref(), Some("sess-new"));
}

#[tokio::test]
async fn missed_heartbeat_acks_close_the_dead_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);
    shard.connect().unwrap();

    let mut ws = accept(&listener).await;
    // Short interval so the dead-connection check trips quickly.
    ws.send(hello(100)).await.unwrap();
    let identify = next_json(&mut ws).await.unwrap();
    assert_eq!(identify["op"], 2);

    // Never acknowledge anything: after two unacknowledged beats the shard
    // must abandon the connection with close code 4000.
    let mut heartbeats = 0;
    let code = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    if frame["op"] == 1 {
                        heartbeats += 1;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|f| u16::from(f.code));
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(code, Some(4000));
    assert!(heartbeats >= 2, "saw {heartbeats} heartbeats");
    drop(ws);

    // No session was established, so the shard identifies again.
    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    let identify = next_json(&mut ws).await.unwrap();
    assert_eq!(identify["op"], 2);
}

#[tokio::test]
async fn heartbeats_carry_the_last_sequence_and_answer_server_requests() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);
    shard.connect().unwrap();

    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    next_json(&mut ws).await.unwrap();
    ws.send(ready(addr, "sess-h")).await.unwrap();
    ws.send(dispatch(7, "MESSAGE_CREATE", json!({}))).await.unwrap();
    wait_for_state(&shard, ShardState::Connected).await;

    // Opcode 1 from the server demands an immediate beat.
    ws.send(text_frame(&json!({"op": 1, "d": null}))).await.unwrap();
    let beat = timeout(Duration::from_secs(5), next_json(&mut ws)).await.unwrap().unwrap();
    assert_eq!(beat["op"], 1);
    assert_eq!(beat["d"], 7);
}

#[tokio::test]
async fn fatal_close_codes_stop_the_shard_with_a_critical_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);

    let critical = tokio::spawn({
        let dispatcher = shard.dispatcher().clone();
        async move {
            dispatcher
                .wait_for("critical".to_owned(), |event| {
                    matches!(event, ShardEvent::Critical(_))
                })
                .await
                .unwrap()
        }
    });
    tokio::task::yield_now().await;

    shard.connect().unwrap();
    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    next_json(&mut ws).await.unwrap();
    ws.send(ready(addr, "sess-f")).await.unwrap();
    wait_for_state(&shard, ShardState::Connected).await;

    ws.send(close_frame(4004)).await.unwrap();
    drop(ws);

    let event = timeout(Duration::from_secs(5), critical).await.unwrap().unwrap();
    assert!(matches!(event, ShardEvent::Critical(GatewayError::InvalidToken)));
    wait_for_state(&shard, ShardState::Disconnected).await;
}

#[tokio::test]
async fn close_sends_1001_and_clears_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shard = test_shard(addr);
    shard.connect().unwrap();

    let mut ws = accept(&listener).await;
    ws.send(hello(60_000)).await.unwrap();
    next_json(&mut ws).await.unwrap();
    ws.send(ready(addr, "sess-c")).await.unwrap();
    wait_for_state(&shard, ShardState::Connected).await;

    shard.close(false).await;
    assert_eq!(next_close_code(&mut ws).await, Some(1001));
    wait_for_state(&shard, ShardState::Disconnected).await;
    assert_eq!(shard.session_id(), None);
    assert_eq!(shard.sequence(), None);
}

#[tokio::test]
async fn manager_spawns_shards_and_aggregates_their_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let api = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gateway/bot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": format!("ws://{addr}"),
            "shards": 2,
            "session_start_limit": {
                "total": 1000,
                "remaining": 998,
                "reset_after": 0,
                "max_concurrency": 2
            }
        })))
        .mount(&api)
        .await;

    let engine = Arc::new(
        HttpEngine::new(HttpConfig {
            base_url: api.uri(),
            ..HttpConfig::default()
        })
        .unwrap(),
    );
    let manager = ShardManager::new(
        ShardManagerOptions {
            token: "manager-token".into(),
            intents: 1,
            ..ShardManagerOptions::default()
        },
        engine,
    )
    .unwrap();

    let message = tokio::spawn({
        let dispatcher = manager.event_dispatcher().clone();
        async move {
            dispatcher
                .wait_for("MESSAGE_CREATE".to_owned(), |_| true)
                .await
                .unwrap()
        }
    });
    let critical = tokio::spawn({
        let dispatcher = manager.dispatcher().clone();
        async move {
            dispatcher
                .wait_for("critical".to_owned(), |_| true)
                .await
                .unwrap()
        }
    });
    tokio::task::yield_now().await;

    manager.connect().await.unwrap();
    assert_eq!(manager.shards().len(), 2);
    assert_eq!(manager.max_concurrency(), Some(2));

    // Both shards connect; each identifies with its own id.
    let mut sessions = Vec::new();
    let mut seen_ids = Vec::new();
    for _ in 0..2 {
        let mut ws = accept(&listener).await;
        ws.send(hello(60_000)).await.unwrap();
        let identify = timeout(Duration::from_secs(5), next_json(&mut ws))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["shard"][1], 2);
        seen_ids.push(identify["d"]["shard"][0].as_u64().unwrap());
        ws.send(ready(addr, &format!("sess-{}", seen_ids.last().unwrap())))
            .await
            .unwrap();
        sessions.push(ws);
    }
    seen_ids.sort_unstable();
    assert_eq!(seen_ids, [0, 1]);

    // A DISPATCH on any shard surfaces on the manager's event dispatcher.
    sessions[0]
        .send(dispatch(2, "MESSAGE_CREATE", json!({"id": "relay"})))
        .await
        .unwrap();
    let data = timeout(Duration::from_secs(5), message).await.unwrap().unwrap();
    assert_eq!(data["id"], "relay");

    // A fatal close on one shard re-emits on the manager's critical channel.
    sessions[1].send(close_frame(4014)).await.unwrap();
    let event = timeout(Duration::from_secs(5), critical).await.unwrap().unwrap();
    assert!(matches!(
        event,
        ShardEvent::Critical(GatewayError::DisallowedIntents)
    ));
}
