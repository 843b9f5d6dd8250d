//! Reverse TCP tunnel. An agent next to a hidden service dials out to a
//! public relay and keeps a pool of idle, handshake-completed connections
//! open; the relay pairs each inbound user connection with one pooled
//! connection and bridges bytes in both directions.

pub mod agent;
pub mod config;
pub mod conn;
pub mod handshake;
pub mod listeners;
pub mod logger;
pub mod registry;
pub mod relay;
pub mod secret;
