//! # CUEMS Core
//!
//! Messaging for the CUEMS show-control platform. A coordinator and its
//! playback nodes exchange JSON control messages over a bus and report
//! liveness through it.
//!
//! - **BusHub**: bus socket with inbound/outbound queues, peer registry,
//!   health counters and ping/pong heartbeat
//! - **RequestResponseChannel**: single round-trip exchanges
//! - **Configuration**: hubs described in TOML or YAML files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cuems_core::{BusHub, Mode};
//! use serde_json::json;
//!
//! # async fn coordinator() -> cuems_core::CuemsResult<()> {
//! let hub = BusHub::new("tcp://0.0.0.0:9092", Mode::Listener)?;
//! let runner = hub.clone();
//! tokio::spawn(async move { runner.start().await });
//!
//! hub.send_message(json!({"action": "arm", "cue": "c-101"}))?;
//! while let Ok(message) = hub.get_message().await {
//!     println!("{}: {:?}", message.sender, message.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod communication;
pub mod error;

// Re-export commonly used types for easy access
pub use communication::bus::{
    BusHub, ConnectionInfo, HealthSnapshot, HeartbeatStats, Message, Mode, Payload, SenderId,
};
pub use communication::config::{CuemsConfig, HubConfig};
pub use communication::reqrep::RequestResponseChannel;
pub use error::{CuemsError, CuemsResult};
