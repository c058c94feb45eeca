/// Registry of live bus connections
///
/// Written only by the hub's registry loop while it drains the transport's
/// pipe events; readers take point-in-time snapshots.
use super::message::SenderId;
use crate::communication::network::{Pipe, PipeEvent, PipeId};
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

/// Descriptor used when a pipe has neither an address nor a URL
pub const UNKNOWN_SENDER: &str = "unknown";

/// Metadata for one connected peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub pipe_id: PipeId,
    pub sender: SenderId,
    pub connected_at: DateTime<Local>,
}

/// Identify the peer behind a pipe
///
/// TCP pipes give a structured socket address; filesystem sockets fall back to
/// the pipe URL, then to `"unknown"`.
pub fn extract_sender(pipe: &Pipe) -> SenderId {
    match (&pipe.remote_address, &pipe.url) {
        (Some(addr), _) => SenderId::addr(addr.ip().to_string(), addr.port()),
        (None, Some(url)) => SenderId::opaque(url.clone()),
        (None, None) => SenderId::opaque(UNKNOWN_SENDER),
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<PipeId, ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transport event
    pub fn apply(&self, event: PipeEvent) {
        match event {
            PipeEvent::Connected(pipe) => self.on_connect(&pipe),
            PipeEvent::Disconnected(pipe) => self.on_disconnect(&pipe),
        }
    }

    pub fn on_connect(&self, pipe: &Pipe) {
        let info = ConnectionInfo {
            pipe_id: pipe.id,
            sender: extract_sender(pipe),
            connected_at: Local::now(),
        };
        info!("Peer connected: pipe {} from {}", info.pipe_id, info.sender);
        if let Some(previous) = self.connections.write().insert(pipe.id, info) {
            warn!(
                "Pipe {} connected twice, replaced entry for {}",
                pipe.id, previous.sender
            );
        }
    }

    pub fn on_disconnect(&self, pipe: &Pipe) {
        match self.connections.write().remove(&pipe.id) {
            Some(info) => info!("Peer disconnected: pipe {} from {}", info.pipe_id, info.sender),
            None => warn!("Disconnect for unknown pipe {}", pipe.id),
        }
    }

    /// Snapshot of live connections, ordered by pipe id
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> =
            self.connections.read().values().cloned().collect();
        connections.sort_by_key(|c| c.pipe_id);
        connections
    }

    pub fn get(&self, pipe_id: PipeId) -> Option<ConnectionInfo> {
        self.connections.read().get(&pipe_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry (socket closed)
    pub fn clear(&self) {
        self.connections.write().clear();
    }
}
