//! # Communication layer for CUEMS
//!
//! - **bus**: many-to-many JSON messaging between the coordinator and its nodes
//! - **reqrep**: one request, one reply, over a dedicated socket pair
//! - **network**: the stream transports both are built on
//! - **config**: hub definitions loaded from TOML/YAML files

pub mod bus;
pub mod config;
pub mod network;
pub mod reqrep;

pub use bus::{BusHub, Message, Mode, SenderId};
pub use config::{CuemsConfig, HubConfig};
pub use reqrep::{PendingRequest, Replier, RequestResponseChannel};
