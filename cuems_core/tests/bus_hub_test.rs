// End-to-end tests for the bus hub over loopback TCP and Unix sockets
use cuems_core::communication::bus::{BusHub, Message, Mode, SenderId};
use cuems_core::communication::network::{parse_endpoint, BusSocket};
use cuems_core::error::{CuemsError, CuemsResult};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

async fn running_hub(address: &str, mode: Mode) -> (BusHub, JoinHandle<CuemsResult<()>>) {
    let hub = BusHub::new(address, mode).unwrap();
    hub.open().await.unwrap();
    let runner = hub.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    wait_until("hub running", || hub.is_running()).await;
    (hub, handle)
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + DEADLINE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

async fn next_message(hub: &BusHub) -> Message {
    timeout(DEADLINE, hub.get_message())
        .await
        .expect("no message within deadline")
        .unwrap()
}

/// Next frame on a raw peer socket, decoded as JSON
async fn next_frame(socket: &BusSocket) -> Value {
    let deadline = Instant::now() + DEADLINE;
    loop {
        assert!(Instant::now() < deadline, "no frame within deadline");
        if let Some(frame) = socket.recv_timeout(Duration::from_millis(100)).await.unwrap() {
            return serde_json::from_slice(&frame.payload).unwrap();
        }
    }
}

/// Listener hub plus a raw dialing peer, connected and registered
async fn hub_with_raw_peer() -> (BusHub, JoinHandle<CuemsResult<()>>, BusSocket) {
    let (hub, handle) = running_hub("tcp://127.0.0.1:0", Mode::Listener).await;
    let address = hub.local_address().unwrap();
    let peer = BusSocket::dial(&parse_endpoint(&address).unwrap()).await.unwrap();
    wait_until("peer registration", || hub.get_connection_count() == 1).await;
    (hub, handle, peer)
}

#[tokio::test]
async fn test_dialer_message_reaches_listener() {
    let (listener, listener_run) = running_hub("tcp://127.0.0.1:0", Mode::Listener).await;
    let address = listener.local_address().unwrap();
    let (dialer, dialer_run) = running_hub(&address, Mode::Dialer).await;

    dialer.send_message(json!({"x": 1})).unwrap();

    let message = next_message(&listener).await;
    assert_eq!(Value::Object(message.data.clone()), json!({"x": 1}));
    match &message.sender {
        SenderId::Addr { ip, port } => {
            assert_eq!(ip, "127.0.0.1");
            assert_ne!(*port, 0);
        }
        other => panic!("expected a TCP sender, got {:?}", other),
    }

    wait_until("registry entry", || listener.get_connection_count() == 1).await;
    assert_eq!(listener.get_active_connections()[0].sender, message.sender);
    assert!(listener.is_connection_healthy(Duration::from_secs(30)));
    assert!(dialer.is_connection_healthy(Duration::from_secs(30)));

    dialer.stop().await;
    listener.stop().await;
    assert!(dialer_run.await.unwrap().is_ok());
    assert!(listener_run.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_listener_broadcasts_to_dialers() {
    let (listener, _listener_run) = running_hub("tcp://127.0.0.1:0", Mode::Listener).await;
    let address = listener.local_address().unwrap();
    let (first, _first_run) = running_hub(&address, Mode::Dialer).await;
    let (second, _second_run) = running_hub(&address, Mode::Dialer).await;
    wait_until("both dialers", || listener.get_connection_count() == 2).await;

    listener.send_message(json!({"action": "go"})).unwrap();

    for dialer in [&first, &second] {
        let message = next_message(dialer).await;
        assert_eq!(message.get("action"), Some(&json!("go")));
    }

    listener.stop().await;
}

#[tokio::test]
async fn test_auto_ping_answered_by_auto_pong() {
    let (listener, _listener_run) = running_hub("tcp://127.0.0.1:0", Mode::Listener).await;
    let address = listener.local_address().unwrap();
    let (dialer, _dialer_run) = running_hub(&address, Mode::Dialer).await;
    wait_until("dialer", || listener.get_connection_count() == 1).await;

    listener
        .enable_auto_ping(Duration::from_millis(100), Duration::from_millis(50))
        .unwrap();

    wait_until("ping delivery", || {
        dialer.get_connection_health_info(Duration::from_secs(30)).messages_received >= 1
    })
    .await;
    wait_until("pong sent", || dialer.heartbeat_stats().pong_count >= 1).await;
    wait_until("pong received", || listener.heartbeat_stats().pongs_received >= 1).await;
    assert!(listener.heartbeat_stats().ping_count >= 1);

    listener.stop().await;
    dialer.stop().await;
}

#[tokio::test]
async fn test_non_object_rejected_before_queueing() {
    let (hub, _run) = running_hub("tcp://127.0.0.1:0", Mode::Listener).await;
    let before = hub.outgoing_len();

    let err = hub.send_message(json!("not-a-mapping")).unwrap_err();
    assert!(matches!(err, CuemsError::InvalidPayload(_)));
    assert_eq!(hub.outgoing_len(), before);

    hub.stop().await;
}

#[tokio::test]
async fn test_disconnect_removes_registry_entry() {
    let (listener, _listener_run) = running_hub("tcp://127.0.0.1:0", Mode::Listener).await;
    let address = listener.local_address().unwrap();
    let (staying, _staying_run) = running_hub(&address, Mode::Dialer).await;
    wait_until("first dialer", || listener.get_connection_count() == 1).await;
    let staying_pipe = listener.get_active_connections()[0].pipe_id;

    let (leaving, leaving_run) = running_hub(&address, Mode::Dialer).await;
    wait_until("second dialer", || listener.get_connection_count() == 2).await;
    let leaving_pipe = listener
        .get_active_connections()
        .into_iter()
        .map(|info| info.pipe_id)
        .find(|id| *id != staying_pipe)
        .unwrap();

    leaving.stop().await;
    assert!(leaving_run.await.unwrap().is_ok());

    wait_until("disconnect", || listener.get_connection_count() == 1).await;
    let remaining = listener.get_active_connections();
    assert_eq!(remaining[0].pipe_id, staying_pipe);
    assert!(remaining.iter().all(|info| info.pipe_id != leaving_pipe));

    staying.stop().await;
    listener.stop().await;
}

#[tokio::test]
async fn test_payload_written_as_json() {
    let (hub, _run, peer) = hub_with_raw_peer().await;

    let payload = json!({"cue": "c-101", "levels": [0.5, 1.0], "armed": true});
    hub.send_message(payload.clone()).unwrap();

    assert_eq!(next_frame(&peer).await, payload);
    wait_until("sent counter", || {
        hub.get_connection_health_info(Duration::from_secs(30)).messages_sent == 1
    })
    .await;
    hub.stop().await;
}

#[tokio::test]
async fn test_payloads_written_in_order() {
    let (hub, _run, peer) = hub_with_raw_peer().await;

    for seq in 0..20 {
        hub.send_message(json!({"seq": seq})).unwrap();
    }
    for seq in 0..20 {
        assert_eq!(next_frame(&peer).await, json!({"seq": seq}));
    }
    assert_eq!(hub.outgoing_len(), 0);
    hub.stop().await;
}

#[tokio::test]
async fn test_ping_answered_and_hidden() {
    let (hub, _run, peer) = hub_with_raw_peer().await;

    let ping = json!({"__type__": "ping", "timestamp": "2024-01-01T00:00:00.000000"});
    peer.send(ping.to_string().as_bytes()).unwrap();
    let pong = json!({"__type__": "pong", "timestamp": "2024-01-01T00:00:01.000000"});
    peer.send(pong.to_string().as_bytes()).unwrap();
    peer.send(json!({"content": "after"}).to_string().as_bytes()).unwrap();

    let message = next_message(&hub).await;
    assert_eq!(Value::Object(message.data), json!({"content": "after"}));

    let reply = next_frame(&peer).await;
    assert_eq!(reply["__type__"], "pong");
    assert_eq!(reply["ping_timestamp"], "2024-01-01T00:00:00.000000");
    assert!(reply["timestamp"].is_string());

    let stats = hub.heartbeat_stats();
    assert_eq!(stats.pong_count, 1);
    assert_eq!(stats.pongs_received, 1);
    assert_eq!(
        hub.get_connection_health_info(Duration::from_secs(30)).messages_received,
        3
    );
    hub.stop().await;
}

#[tokio::test]
async fn test_no_pong_when_auto_pong_disabled() {
    let (hub, _run, peer) = hub_with_raw_peer().await;
    hub.disable_auto_pong();

    let ping = json!({"__type__": "ping", "timestamp": "2024-01-01T00:00:00.000000"});
    peer.send(ping.to_string().as_bytes()).unwrap();
    peer.send(json!({"marker": true}).to_string().as_bytes()).unwrap();

    // The marker arriving means the ping was processed first
    let message = next_message(&hub).await;
    assert_eq!(message.get("marker"), Some(&json!(true)));
    assert!(peer
        .recv_timeout(Duration::from_millis(300))
        .await
        .unwrap()
        .is_none());
    assert_eq!(hub.heartbeat_stats().pong_count, 0);
    hub.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_delivered_as_raw_data() {
    let (hub, _run, peer) = hub_with_raw_peer().await;

    peer.send(b"not json at all").unwrap();
    peer.send(b"[1, 2, 3]").unwrap();

    let first = next_message(&hub).await;
    assert_eq!(Value::Object(first.data), json!({"raw_data": "not json at all"}));
    let second = next_message(&hub).await;
    assert_eq!(Value::Object(second.data), json!({"raw_data": "[1, 2, 3]"}));
    hub.stop().await;
}

#[tokio::test]
async fn test_manual_ping_reaches_peer() {
    let (hub, _run, peer) = hub_with_raw_peer().await;

    assert_eq!(hub.send_ping().unwrap(), 1);
    let ping = next_frame(&peer).await;
    assert_eq!(ping["__type__"], "ping");
    assert!(ping["timestamp"].is_string());
    assert_eq!(hub.heartbeat_stats().ping_count, 1);
    hub.stop().await;
}

#[tokio::test]
async fn test_resent_message_uses_its_data() {
    let (listener, _listener_run) = running_hub("tcp://127.0.0.1:0", Mode::Listener).await;
    let address = listener.local_address().unwrap();
    let (dialer, _dialer_run) = running_hub(&address, Mode::Dialer).await;
    wait_until("dialer", || listener.get_connection_count() == 1).await;

    dialer.send_message(json!({"echo": "me"})).unwrap();
    let received = next_message(&listener).await;
    listener.send_message(received).unwrap();

    let echoed = next_message(&dialer).await;
    assert_eq!(Value::Object(echoed.data), json!({"echo": "me"}));
    listener.stop().await;
    dialer.stop().await;
}

#[tokio::test]
async fn test_stop_then_restart() {
    let (hub, run) = running_hub("tcp://127.0.0.1:0", Mode::Listener).await;

    hub.stop().await;
    assert!(run.await.unwrap().is_ok());
    assert!(!hub.is_running());
    assert!(hub.local_address().is_none());

    let runner = hub.clone();
    let restarted = tokio::spawn(async move { runner.start().await });
    wait_until("restart", || hub.is_running()).await;
    assert!(hub.local_address().is_some());

    hub.stop().await;
    assert!(restarted.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_dropping_start_future_closes_hub() {
    let hub = BusHub::new("tcp://127.0.0.1:0", Mode::Listener).unwrap();
    let runner = hub.clone();
    let handle = tokio::spawn(async move { runner.start().await });
    wait_until("running", || hub.is_running()).await;

    handle.abort();
    let _ = handle.await;
    assert!(!hub.is_running());
    assert!(!hub.is_open());
}

#[cfg(unix)]
#[tokio::test]
async fn test_ipc_bus() {
    let dir = tempfile::tempdir().unwrap();
    let address = format!("ipc://{}", dir.path().join("bus.sock").display());

    let (listener, _listener_run) = running_hub(&address, Mode::Listener).await;
    let (dialer, _dialer_run) = running_hub(&address, Mode::Dialer).await;

    dialer.send_message(json!({"via": "ipc"})).unwrap();
    let message = next_message(&listener).await;
    assert_eq!(message.get("via"), Some(&json!("ipc")));
    assert_eq!(message.sender, SenderId::opaque(address.clone()));

    wait_until("registry entry", || listener.get_connection_count() == 1).await;
    dialer.stop().await;
    listener.stop().await;
    let socket_path = dir.path().join("bus.sock");
    wait_until("socket file removal", || !socket_path.exists()).await;
}
