//! # Bus messaging hub
//!
//! A JSON message channel over a bus-topology socket:
//!
//! - **BusHub**: owns the socket, the inbound/outbound queues and the loops
//! - **ConnectionRegistry**: live peers, fed by pipe connect/disconnect events
//! - **HealthMonitor**: activity counters and a liveness verdict
//! - **Heartbeat**: optional auto-ping, auto-pong (on by default)
//!
//! ```rust,no_run
//! use cuems_core::communication::bus::{BusHub, Mode};
//! use std::time::Duration;
//!
//! # async fn node() -> cuems_core::error::CuemsResult<()> {
//! let hub = BusHub::new("tcp://controller.local:9092", Mode::Dialer)?;
//! hub.enable_auto_ping(Duration::from_secs(10), Duration::from_secs(5))?;
//! hub.start().await
//! # }
//! ```

pub mod envelope;
pub mod health;
pub mod heartbeat;
pub mod hub;
pub mod message;
pub mod registry;

pub use health::{HealthMonitor, HealthSnapshot, DEFAULT_ACTIVITY_TIMEOUT};
pub use heartbeat::{AutoPing, HeartbeatStats};
pub use hub::{BusHub, Mode, RECEIVE_TIMEOUT};
pub use message::{JsonMap, Message, Payload, SenderId};
pub use registry::{ConnectionInfo, ConnectionRegistry};
