//! Palaver node runtime: datagram transport, chat protocol handler, peer
//! directory, configuration.

pub mod chat;
pub mod config;
pub mod conn;
pub mod node;
pub mod transport;
