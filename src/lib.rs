//! Local LAN terminator for the Cync/C-by-GE bridge protocol: accepts
//! TLS-wrapped TCP connections from bridges, speaks the ten-packet-type
//! framed protocol documented in [`codec`], and exposes device state and
//! command dispatch to whatever's on the other side of [`northbound`].

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod framer;
pub mod metrics;
pub mod northbound;
pub mod registry;
pub mod roster;
pub mod server;
pub mod transport;

pub use error::{Error, Kind, Result};
