/// Bus messaging hub
///
/// Wraps a bus socket with two FIFO queues, a connection registry, health
/// counters and the ping/pong heartbeat. Application code only touches the
/// queues (`send_message` / `get_message`); four loops move data between
/// the queues and the socket while `run()` is active.
use super::envelope;
use super::health::{HealthMonitor, HealthSnapshot};
use super::heartbeat::{AutoPing, Heartbeat, HeartbeatStats, Inbound};
use super::message::{Message, Payload};
use super::registry::{extract_sender, ConnectionInfo, ConnectionRegistry};
use crate::communication::config::HubConfig;
use crate::communication::network::{
    check_ipc_path, parse_endpoint, BusSocket, Endpoint, Frame, PipeEvent, SocketRole,
};
use crate::error::{CuemsError, CuemsResult};
use chrono::Local;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Receive poll timeout; a timeout is the common case on a quiet bus
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Which end of the bus this hub is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Binds the address and accepts many dialers (coordinator)
    Listener,
    /// Connects to a known address (node)
    Dialer,
}

impl Mode {
    fn socket_role(self) -> SocketRole {
        match self {
            Mode::Listener => SocketRole::Listen,
            Mode::Dialer => SocketRole::Dial,
        }
    }
}

impl FromStr for Mode {
    type Err = CuemsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "listener" | "controller" => Ok(Mode::Listener),
            "dialer" | "node" => Ok(Mode::Dialer),
            other => Err(CuemsError::config(format!(
                "Unknown hub mode '{}' (expected listener or dialer)",
                other
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Listener => f.write_str("listener"),
            Mode::Dialer => f.write_str("dialer"),
        }
    }
}

/// Where a hub is in its open/run cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Opening,
    Running,
}

/// Phase and pending stop request live in one watch so a stop can never
/// slip between two transitions
#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    phase: Phase,
    stop_requested: bool,
}

struct HubInner {
    address: String,
    endpoint: Endpoint,
    mode: Mode,
    socket: RwLock<Option<Arc<BusSocket>>>,

    outgoing_tx: mpsc::UnboundedSender<String>,
    outgoing_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    outgoing_len: AtomicUsize,
    incoming_tx: mpsc::UnboundedSender<Message>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Message>>,

    registry: ConnectionRegistry,
    health: HealthMonitor,
    heartbeat: Heartbeat,

    lifecycle: watch::Sender<Lifecycle>,
}

impl HubInner {
    /// Move from `from` to `to`; false if the hub is in another phase
    fn transition(&self, from: Phase, to: Phase) -> bool {
        self.lifecycle.send_if_modified(|lifecycle| {
            if lifecycle.phase == from {
                lifecycle.phase = to;
                true
            } else {
                false
            }
        })
    }

    fn stop_requested(&self) -> bool {
        self.lifecycle.borrow().stop_requested
    }

    fn enqueue(&self, text: String) -> CuemsResult<()> {
        self.outgoing_len.fetch_add(1, Ordering::AcqRel);
        if self.outgoing_tx.send(text).is_err() {
            self.outgoing_len.fetch_sub(1, Ordering::AcqRel);
            return Err(CuemsError::Internal("outgoing queue closed".to_string()));
        }
        Ok(())
    }

    fn send_ping(&self) -> CuemsResult<usize> {
        let ping = self.heartbeat.make_ping();
        self.enqueue(envelope::encode(&ping)?)?;
        debug!("Ping queued on {}", self.address);
        Ok(1)
    }

    fn process_frame(&self, frame: Frame) {
        let sender = extract_sender(&frame.pipe);
        let data = envelope::decode(&frame.payload);
        self.health.record_received();

        match self.heartbeat.handle_inbound(data, &sender) {
            Inbound::Deliver(data) => {
                // Receiver half lives in `self`, the send cannot fail
                let _ = self.incoming_tx.send(Message::new(data, sender));
            }
            Inbound::Consumed { reply: Some(pong) } => {
                if let Err(e) = envelope::encode(&pong).and_then(|text| self.enqueue(text)) {
                    warn!("Failed to queue pong for {}: {}", sender, e);
                }
            }
            Inbound::Consumed { reply: None } => {}
        }
    }
}

async fn sender_loop(inner: Arc<HubInner>, socket: Arc<BusSocket>) -> CuemsResult<()> {
    let mut outgoing = inner.outgoing_rx.lock().await;
    while let Some(text) = outgoing.recv().await {
        inner.outgoing_len.fetch_sub(1, Ordering::AcqRel);
        match socket.send(text.as_bytes()) {
            Ok(pipes) => {
                inner.health.record_sent();
                debug!("Sent {} bytes to {} pipe(s)", text.len(), pipes);
            }
            Err(e) => warn!("Failed to send message on {}: {}", inner.address, e),
        }
    }
    Ok(())
}

async fn receiver_loop(inner: Arc<HubInner>, socket: Arc<BusSocket>) -> CuemsResult<()> {
    loop {
        if let Some(frame) = socket.recv_timeout(RECEIVE_TIMEOUT).await? {
            inner.process_frame(frame);
        }
    }
}

async fn auto_ping_loop(inner: Arc<HubInner>) -> CuemsResult<()> {
    let mut settings = inner.heartbeat.subscribe();
    loop {
        let current = *settings.borrow_and_update();
        match current {
            AutoPing::Disabled => {
                if settings.changed().await.is_err() {
                    return Ok(());
                }
            }
            AutoPing::Enabled {
                interval,
                inactivity_threshold,
            } => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if Heartbeat::ping_due(&inner.health, Local::now(), inactivity_threshold) {
                            inner.send_ping()?;
                        }
                    }
                    changed = settings.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

async fn registry_loop(
    inner: Arc<HubInner>,
    mut events: mpsc::UnboundedReceiver<PipeEvent>,
) -> CuemsResult<()> {
    while let Some(event) = events.recv().await {
        inner.registry.apply(event);
    }
    Ok(())
}

/// Wait for the first loop to fail. Loops that finish cleanly are skipped.
async fn first_failure(tasks: &mut JoinSet<CuemsResult<()>>) -> CuemsResult<()> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => return Err(e),
            Err(e) if e.is_panic() => {
                return Err(CuemsError::Internal(format!("hub loop panicked: {}", e)))
            }
            Err(_) => continue,
        }
    }
    Ok(())
}

/// Returns an opening hub to idle unless the open is handed over to a run
struct OpeningGuard {
    inner: Arc<HubInner>,
    armed: bool,
}

impl Drop for OpeningGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.transition(Phase::Opening, Phase::Idle);
        }
    }
}

/// Tears a run down however it exits, including when its future is dropped.
/// A run consumes the pending stop request.
struct RunGuard {
    inner: Arc<HubInner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(socket) = self.inner.socket.write().take() {
            socket.close();
        }
        self.inner.registry.clear();
        self.inner.lifecycle.send_modify(|lifecycle| {
            lifecycle.phase = Phase::Idle;
            lifecycle.stop_requested = false;
        });
    }
}

/// Structured JSON message channel over a bus socket
///
/// Cheap to clone: every clone drives the same hub, so one clone can sit in
/// `start()` while others send and receive.
///
/// # Example
///
/// ```rust,no_run
/// use cuems_core::communication::bus::{BusHub, Mode};
/// use serde_json::json;
///
/// # async fn demo() -> cuems_core::error::CuemsResult<()> {
/// let hub = BusHub::new("tcp://127.0.0.1:9092", Mode::Listener)?;
/// let runner = hub.clone();
/// tokio::spawn(async move { runner.start().await });
///
/// hub.send_message(json!({"action": "go", "cue": 12}))?;
/// let message = hub.get_message().await?;
/// println!("{} says {:?}", message.sender, message.data);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BusHub {
    inner: Arc<HubInner>,
}

impl BusHub {
    /// Validate `address` and build an unstarted hub
    pub fn new(address: &str, mode: Mode) -> CuemsResult<Self> {
        let endpoint = parse_endpoint(address)?;
        if let Endpoint::Ipc { path } = &endpoint {
            check_ipc_path(path)?;
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle {
            phase: Phase::Idle,
            stop_requested: false,
        });

        Ok(Self {
            inner: Arc::new(HubInner {
                address: address.to_string(),
                endpoint,
                mode,
                socket: RwLock::new(None),
                outgoing_tx,
                outgoing_rx: Mutex::new(outgoing_rx),
                outgoing_len: AtomicUsize::new(0),
                incoming_tx,
                incoming_rx: Mutex::new(incoming_rx),
                registry: ConnectionRegistry::new(),
                health: HealthMonitor::new(),
                heartbeat: Heartbeat::new(),
                lifecycle,
            }),
        })
    }

    /// Build a hub from configuration, heartbeat settings included
    pub fn from_config(config: &HubConfig) -> CuemsResult<Self> {
        let hub = Self::new(&config.address()?, config.mode()?)?;
        if let Some(auto_ping) = &config.auto_ping {
            hub.enable_auto_ping(auto_ping.interval()?, auto_ping.inactivity_threshold()?)?;
        }
        if !config.auto_pong {
            hub.disable_auto_pong();
        }
        info!("Hub '{}' configured: {} on {}", config.name, hub.mode(), hub.address());
        Ok(hub)
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Address of the open socket, with a bound port 0 resolved
    pub fn local_address(&self) -> Option<String> {
        self.inner
            .socket
            .read()
            .as_ref()
            .map(|socket| socket.endpoint().url())
    }

    pub fn is_open(&self) -> bool {
        self.inner.socket.read().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.borrow().phase == Phase::Running
    }

    fn busy(&self) -> CuemsError {
        CuemsError::communication(format!(
            "Hub on {} is already opening or running",
            self.inner.address
        ))
    }

    fn begin_opening(&self) -> CuemsResult<OpeningGuard> {
        if !self.inner.transition(Phase::Idle, Phase::Opening) {
            return Err(self.busy());
        }
        Ok(OpeningGuard {
            inner: Arc::clone(&self.inner),
            armed: true,
        })
    }

    /// Bind or dial according to the mode. No automatic reconnection.
    pub async fn open(&self) -> CuemsResult<()> {
        let _opening = self.begin_opening()?;
        self.open_socket().await
    }

    async fn open_socket(&self) -> CuemsResult<()> {
        if self.is_open() {
            return Err(CuemsError::communication(format!(
                "Hub on {} is already open",
                self.inner.address
            )));
        }

        let socket = BusSocket::open(&self.inner.endpoint, self.inner.mode.socket_role())
            .await
            .map_err(|e| {
                error!("Failed to open {} on {}: {}", self.inner.mode, self.inner.address, e);
                e
            })?;

        info!("Hub {} open on {}", self.inner.mode, socket.endpoint());
        *self.inner.socket.write() = Some(Arc::new(socket));
        Ok(())
    }

    /// Run the loops until one fails or `stop()` is called
    ///
    /// On the first failure every other loop is aborted and awaited before the
    /// error is returned. The socket is closed on exit; call `open()` again
    /// before another run.
    pub async fn run(&self) -> CuemsResult<()> {
        if !self.inner.transition(Phase::Idle, Phase::Running) {
            return Err(self.busy());
        }
        self.run_loops().await
    }

    /// `open()` then `run()`, with no idle gap in between
    pub async fn start(&self) -> CuemsResult<()> {
        let mut opening = self.begin_opening()?;
        self.open_socket().await?;
        opening.armed = false;
        self.inner.transition(Phase::Opening, Phase::Running);
        self.run_loops().await
    }

    /// Body of a run; the caller has already moved the hub to `Running`
    async fn run_loops(&self) -> CuemsResult<()> {
        let _guard = RunGuard {
            inner: Arc::clone(&self.inner),
        };

        if self.inner.stop_requested() {
            info!("Hub on {} stopped before it started running", self.inner.address);
            return Ok(());
        }

        let socket = self.inner.socket.read().clone().ok_or_else(|| {
            CuemsError::communication(format!("Hub on {} is not open", self.inner.address))
        })?;
        let events = socket.take_events().ok_or_else(|| {
            CuemsError::Internal("pipe events already taken from socket".to_string())
        })?;

        let mut tasks = JoinSet::new();
        tasks.spawn(registry_loop(Arc::clone(&self.inner), events));
        tasks.spawn(sender_loop(Arc::clone(&self.inner), Arc::clone(&socket)));
        tasks.spawn(receiver_loop(Arc::clone(&self.inner), Arc::clone(&socket)));
        tasks.spawn(auto_ping_loop(Arc::clone(&self.inner)));
        info!("Hub running on {}", socket.endpoint());

        let mut lifecycle = self.inner.lifecycle.subscribe();
        let outcome = tokio::select! {
            _ = async { let _ = lifecycle.wait_for(|l| l.stop_requested).await; } => {
                info!("Hub on {} stopping", socket.endpoint());
                Ok(())
            }
            failure = first_failure(&mut tasks) => failure,
        };

        tasks.shutdown().await;
        if let Err(ref e) = outcome {
            error!("Hub loop failed on {}: {}", socket.endpoint(), e);
        }
        outcome
    }

    /// Cancel the hub and wait until its loops are gone and the socket is
    /// closed. Also closes a hub that was opened but never run.
    ///
    /// A stop that arrives before the hub runs (e.g. `start()` spawned but not
    /// yet polled) is kept, and ends the next run as soon as it begins.
    pub async fn stop(&self) {
        self.inner
            .lifecycle
            .send_modify(|lifecycle| lifecycle.stop_requested = true);
        let mut lifecycle = self.inner.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|l| l.phase == Phase::Idle).await;

        if !self.is_running() {
            if let Some(socket) = self.inner.socket.write().take() {
                socket.close();
            }
        }
    }

    /// Queue a payload for every connected peer
    ///
    /// Accepts a JSON object map, a received [`Message`] (its data is sent) or
    /// a dynamic `serde_json::Value`. A value that is not an object is
    /// rejected before anything is queued.
    pub fn send_message<P>(&self, payload: P) -> CuemsResult<()>
    where
        P: TryInto<Payload>,
        CuemsError: From<P::Error>,
    {
        let payload: Payload = payload.try_into()?;
        self.inner.enqueue(payload.encode()?)
    }

    /// Next application message, in arrival order. Pings and pongs never show up here.
    pub async fn get_message(&self) -> CuemsResult<Message> {
        self.inner
            .incoming_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| CuemsError::Internal("incoming queue closed".to_string()))
    }

    /// Payloads queued but not yet written to the socket
    pub fn outgoing_len(&self) -> usize {
        self.inner.outgoing_len.load(Ordering::Acquire)
    }

    pub fn get_active_connections(&self) -> Vec<ConnectionInfo> {
        self.inner.registry.snapshot()
    }

    pub fn get_connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn get_connection_health_info(&self, activity_timeout: Duration) -> HealthSnapshot {
        self.inner.health.snapshot(activity_timeout)
    }

    pub fn is_connection_healthy(&self, activity_timeout: Duration) -> bool {
        self.inner.health.is_healthy(activity_timeout)
    }

    pub fn enable_auto_ping(
        &self,
        interval: Duration,
        inactivity_threshold: Duration,
    ) -> CuemsResult<()> {
        self.inner
            .heartbeat
            .enable_auto_ping(interval, inactivity_threshold)
    }

    pub fn disable_auto_ping(&self) {
        self.inner.heartbeat.disable_auto_ping();
    }

    pub fn enable_auto_pong(&self) {
        self.inner.heartbeat.enable_auto_pong();
    }

    pub fn disable_auto_pong(&self) {
        self.inner.heartbeat.disable_auto_pong();
    }

    /// Queue a ping now. Returns the number of pings queued (always 1).
    pub fn send_ping(&self) -> CuemsResult<usize> {
        self.inner.send_ping()
    }

    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        self.inner.heartbeat.stats()
    }
}

impl fmt::Debug for BusHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusHub")
            .field("address", &self.inner.address)
            .field("mode", &self.inner.mode)
            .field("open", &self.is_open())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::bus::message::SenderId;
    use serde_json::json;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("listener".parse::<Mode>().unwrap(), Mode::Listener);
        assert_eq!("Controller".parse::<Mode>().unwrap(), Mode::Listener);
        assert_eq!("dialer".parse::<Mode>().unwrap(), Mode::Dialer);
        assert_eq!(" NODE ".parse::<Mode>().unwrap(), Mode::Dialer);
        assert!(matches!("pair".parse::<Mode>(), Err(CuemsError::Config(_))));
        assert_eq!(Mode::Dialer.to_string(), "dialer");
    }

    #[test]
    fn test_new_validates_address() {
        assert!(BusHub::new("tcp://127.0.0.1:9092", Mode::Listener).is_ok());
        assert!(matches!(
            BusHub::new("udp://127.0.0.1:9092", Mode::Listener),
            Err(CuemsError::Config(_))
        ));
        assert!(matches!(
            BusHub::new("ipc:///nonexistent-dir-for-cuems/bus.sock", Mode::Dialer),
            Err(CuemsError::Config(_))
        ));
    }

    #[test]
    fn test_send_message_queues_objects() {
        let hub = BusHub::new("tcp://127.0.0.1:9092", Mode::Dialer).unwrap();
        hub.send_message(json!({"test": "value"})).unwrap();

        let data = json!({"x": 1}).as_object().cloned().unwrap();
        hub.send_message(data.clone()).unwrap();
        hub.send_message(Message::new(data, SenderId::opaque("peer")))
            .unwrap();
        assert_eq!(hub.outgoing_len(), 3);
    }

    #[test]
    fn test_send_message_rejects_non_objects() {
        let hub = BusHub::new("tcp://127.0.0.1:9092", Mode::Dialer).unwrap();
        for bad in [json!("not-a-mapping"), json!([1, 2]), json!(42), json!(null)] {
            let err = hub.send_message(bad).unwrap_err();
            assert!(err.is_usage_error());
        }
        assert_eq!(hub.outgoing_len(), 0);
    }

    #[test]
    fn test_send_ping() {
        let hub = BusHub::new("tcp://127.0.0.1:9092", Mode::Dialer).unwrap();
        assert_eq!(hub.send_ping().unwrap(), 1);
        assert_eq!(hub.heartbeat_stats().ping_count, 1);
        assert_eq!(hub.outgoing_len(), 1);
    }

    #[test]
    fn test_heartbeat_toggles() {
        let hub = BusHub::new("tcp://127.0.0.1:9092", Mode::Listener).unwrap();
        assert!(hub.heartbeat_stats().auto_pong);
        hub.disable_auto_pong();
        assert!(!hub.heartbeat_stats().auto_pong);

        assert!(hub.enable_auto_ping(Duration::ZERO, Duration::ZERO).is_err());
        hub.enable_auto_ping(Duration::from_secs(1), Duration::from_millis(500))
            .unwrap();
        assert_ne!(hub.heartbeat_stats().auto_ping, AutoPing::Disabled);
        hub.disable_auto_ping();
        assert_eq!(hub.heartbeat_stats().auto_ping, AutoPing::Disabled);
    }

    #[test]
    fn test_unstarted_hub_is_unhealthy() {
        let hub = BusHub::new("tcp://127.0.0.1:9092", Mode::Listener).unwrap();
        assert!(!hub.is_connection_healthy(Duration::from_secs(30)));
        assert_eq!(hub.get_connection_count(), 0);
        assert!(hub.get_active_connections().is_empty());
        assert!(hub.local_address().is_none());
    }

    #[test]
    fn test_from_config() {
        let mut config = HubConfig::new("coordinator", "tcp://127.0.0.1:0");
        config.mode = Some("controller".to_string());
        config.auto_pong = false;
        config.auto_ping = Some(Default::default());

        let hub = BusHub::from_config(&config).unwrap();
        assert_eq!(hub.mode(), Mode::Listener);
        let stats = hub.heartbeat_stats();
        assert!(!stats.auto_pong);
        assert_eq!(
            stats.auto_ping,
            AutoPing::Enabled {
                interval: Duration::from_secs(10),
                inactivity_threshold: Duration::from_secs(5),
            }
        );
    }

    #[tokio::test]
    async fn test_run_requires_open() {
        let hub = BusHub::new("tcp://127.0.0.1:0", Mode::Listener).unwrap();
        assert!(hub.run().await.is_err());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let hub = BusHub::new("tcp://127.0.0.1:0", Mode::Listener).unwrap();
        hub.open().await.unwrap();
        let address = hub.local_address().unwrap();
        assert!(!address.ends_with(":0"));

        let runner = hub.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !hub.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hub.is_running());

        hub.stop().await;
        assert!(!hub.is_running());
        assert!(!hub.is_open());
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_polled() {
        let hub = BusHub::new("tcp://127.0.0.1:0", Mode::Listener).unwrap();
        let runner = hub.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        // The spawned start has not run yet on this single-threaded runtime
        hub.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("start kept running after stop")
            .unwrap();
        assert!(result.is_ok());
        assert!(!hub.is_running());
        assert!(!hub.is_open());

        // The stop was consumed; the next start runs normally
        let runner = hub.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !hub.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hub.is_running());
        hub.stop().await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_loop_failure_stops_the_other_loops() {
        let hub = BusHub::new("tcp://127.0.0.1:0", Mode::Listener).unwrap();
        hub.open().await.unwrap();
        let runner = hub.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        // Sender loop holds the outgoing queue, auto-ping loop watches its settings
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (hub.inner.outgoing_rx.try_lock().is_ok()
            || hub.inner.heartbeat.subscriber_count() == 0)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hub.is_running());
        assert_eq!(hub.inner.heartbeat.subscriber_count(), 1);

        hub.inner.socket.read().as_ref().unwrap().close();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not fail after the socket closed")
            .unwrap();
        assert!(matches!(result, Err(CuemsError::Communication(_))));
        assert!(!hub.is_running());
        assert!(!hub.is_open());
        assert!(hub.inner.outgoing_rx.try_lock().is_ok());
        assert_eq!(hub.inner.heartbeat.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let hub = BusHub::new("tcp://127.0.0.1:0", Mode::Listener).unwrap();
        hub.open().await.unwrap();
        assert!(hub.open().await.is_err());
        hub.stop().await;
        assert!(!hub.is_open());
    }

    #[tokio::test]
    async fn test_dial_failure_is_startup_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let hub = BusHub::new(&format!("tcp://127.0.0.1:{}", port), Mode::Dialer).unwrap();
        assert!(hub.start().await.is_err());
        assert!(!hub.is_running());
    }
}
