/// Bus-topology socket over stream transports
///
/// A listening socket accepts any number of dialers; a dialing socket holds a
/// single connection. Every live connection is a *pipe*. `send` writes the
/// frame to every pipe, received frames from all pipes are merged into one
/// inbound stream tagged with the pipe they came from. Frames are never
/// forwarded between pipes.
///
/// Pipe connect/disconnect is reported as [`PipeEvent`]s on a channel rather
/// than through callbacks, so the consumer owns its state without re-entrancy.
use super::endpoint::Endpoint;
use super::framing::{read_frame, write_frame, MAX_FRAME_SIZE};
use super::stream::{dial, Connection, StreamListener};
use crate::error::{CuemsError, CuemsResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

pub type PipeId = u32;

/// Back-off after a failed `accept` (e.g. out of file descriptors)
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handle describing one live connection to a remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipe {
    /// Unique among live pipes of one socket
    pub id: PipeId,
    /// Routable peer address, `None` for filesystem sockets
    pub remote_address: Option<SocketAddr>,
    /// URL describing the pipe (peer URL for TCP, socket URL for ipc)
    pub url: Option<String>,
}

/// Pipe lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    Connected(Pipe),
    Disconnected(Pipe),
}

/// One received frame and the pipe it arrived on
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub pipe: Pipe,
}

/// Whether the socket binds or connects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Listen,
    Dial,
}

struct PipeSlot {
    pipe: Pipe,
    tx: mpsc::UnboundedSender<Arc<[u8]>>,
    reader: AbortHandle,
    writer: AbortHandle,
}

struct SocketShared {
    pipes: RwLock<HashMap<PipeId, PipeSlot>>,
    next_pipe_id: AtomicU32,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    events_tx: mpsc::UnboundedSender<PipeEvent>,
    closed: AtomicBool,
    url: String,
}

impl SocketShared {
    fn attach(self: &Arc<Self>, connection: Connection) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let id = self.next_pipe_id.fetch_add(1, Ordering::Relaxed);
        match connection {
            Connection::Tcp { stream, peer } => {
                let pipe = Pipe {
                    id,
                    remote_address: Some(peer),
                    url: Some(format!("tcp://{}", peer)),
                };
                self.spawn_pipe(pipe, stream);
            }
            #[cfg(unix)]
            Connection::Unix { stream } => {
                let pipe = Pipe {
                    id,
                    remote_address: None,
                    url: Some(self.url.clone()),
                };
                self.spawn_pipe(pipe, stream);
            }
        }
    }

    fn spawn_pipe<S>(self: &Arc<Self>, pipe: Pipe, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = pipe.id;
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<[u8]>>();

        // Hold the table lock until the slot is inserted so a pipe that dies
        // immediately still reports Connected before Disconnected.
        let mut pipes = self.pipes.write();
        info!("Pipe {} connected ({})", id, pipe.url.as_deref().unwrap_or("unknown"));
        let _ = self.events_tx.send(PipeEvent::Connected(pipe.clone()));

        let shared = Arc::clone(self);
        let writer = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &data).await {
                    warn!("Write to pipe {} failed: {}", id, e);
                    break;
                }
            }
            shared.drop_pipe(id);
        });

        let shared = Arc::clone(self);
        let reader_pipe = pipe.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(payload)) => {
                        let frame = Frame {
                            payload,
                            pipe: reader_pipe.clone(),
                        };
                        if shared.inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Pipe {} closed by peer", id);
                        break;
                    }
                    Err(e) => {
                        warn!("Read from pipe {} failed: {}", id, e);
                        break;
                    }
                }
            }
            shared.drop_pipe(id);
        });

        pipes.insert(
            id,
            PipeSlot {
                pipe,
                tx,
                reader: reader.abort_handle(),
                writer: writer.abort_handle(),
            },
        );
    }

    fn drop_pipe(&self, id: PipeId) {
        let slot = self.pipes.write().remove(&id);
        if let Some(slot) = slot {
            slot.reader.abort();
            slot.writer.abort();
            if !self.closed.load(Ordering::Acquire) {
                info!("Pipe {} disconnected", id);
                let _ = self.events_tx.send(PipeEvent::Disconnected(slot.pipe));
            }
        }
    }
}

/// Bus socket bound or dialed to one endpoint
pub struct BusSocket {
    role: SocketRole,
    endpoint: Endpoint,
    shared: Arc<SocketShared>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PipeEvent>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl BusSocket {
    /// Bind the endpoint and accept dialers in the background
    pub async fn listen(endpoint: &Endpoint) -> CuemsResult<Self> {
        let listener = StreamListener::bind(endpoint).await?;
        let local = listener.local_endpoint(endpoint)?;
        let socket = Self::with_endpoint(SocketRole::Listen, local);

        let shared = Arc::clone(&socket.shared);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(connection) => shared.attach(connection),
                    Err(e) => {
                        error!("Failed to accept connection on {}: {}", shared.url, e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        });
        *socket.accept_task.lock() = Some(accept_task);

        info!("Bus socket listening on {}", socket.endpoint);
        Ok(socket)
    }

    /// Connect to a listening bus socket
    pub async fn dial(endpoint: &Endpoint) -> CuemsResult<Self> {
        let connection = dial(endpoint).await?;
        let socket = Self::with_endpoint(SocketRole::Dial, endpoint.clone());
        socket.shared.attach(connection);
        info!("Bus socket dialed {}", socket.endpoint);
        Ok(socket)
    }

    pub async fn open(endpoint: &Endpoint, role: SocketRole) -> CuemsResult<Self> {
        match role {
            SocketRole::Listen => Self::listen(endpoint).await,
            SocketRole::Dial => Self::dial(endpoint).await,
        }
    }

    fn with_endpoint(role: SocketRole, endpoint: Endpoint) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared {
            pipes: RwLock::new(HashMap::new()),
            next_pipe_id: AtomicU32::new(1),
            inbound_tx,
            events_tx,
            closed: AtomicBool::new(false),
            url: endpoint.url(),
        });

        Self {
            role,
            endpoint,
            shared,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            events_rx: Mutex::new(Some(events_rx)),
            accept_task: Mutex::new(None),
        }
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    /// Bound endpoint for listeners (port 0 resolved), target for dialers
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Take the pipe event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PipeEvent>> {
        self.events_rx.lock().take()
    }

    pub fn pipe_count(&self) -> usize {
        self.shared.pipes.read().len()
    }

    pub fn pipes(&self) -> Vec<Pipe> {
        self.shared
            .pipes
            .read()
            .values()
            .map(|slot| slot.pipe.clone())
            .collect()
    }

    /// Queue a frame for every live pipe. Returns how many pipes it went to;
    /// zero peers is not an error on a bus.
    pub fn send(&self, payload: &[u8]) -> CuemsResult<usize> {
        if self.is_closed() {
            return Err(CuemsError::communication(format!(
                "Bus socket {} is closed",
                self.endpoint
            )));
        }
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CuemsError::Transport(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("message of {} bytes exceeds frame limit", payload.len()),
            )));
        }

        let data: Arc<[u8]> = Arc::from(payload);
        let pipes = self.shared.pipes.read();
        let mut delivered = 0;
        for slot in pipes.values() {
            if slot.tx.send(Arc::clone(&data)).is_ok() {
                delivered += 1;
            } else {
                warn!("Pipe {} writer is gone, frame dropped", slot.pipe.id);
            }
        }
        if pipes.is_empty() {
            debug!("No peers on {}, frame dropped", self.endpoint);
        }
        Ok(delivered)
    }

    /// Wait up to `timeout` for a frame. `Ok(None)` on timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> CuemsResult<Option<Frame>> {
        if self.is_closed() {
            return Err(CuemsError::communication(format!(
                "Bus socket {} is closed",
                self.endpoint
            )));
        }

        let mut inbound = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(CuemsError::communication("Bus socket inbound stream ended")),
            Err(_) => Ok(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting, drop every pipe. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let slots: Vec<PipeSlot> = self.shared.pipes.write().drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.reader.abort();
            slot.writer.abort();
        }
        info!("Bus socket {} closed", self.endpoint);
    }
}

impl Drop for BusSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BusSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSocket")
            .field("role", &self.role)
            .field("endpoint", &self.endpoint)
            .field("pipes", &self.pipe_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
