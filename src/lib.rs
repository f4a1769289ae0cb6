//! # Text relay
//!
//! A minimal real-time text relay. Participants connect over TCP, introduce
//! themselves with a handshake frame carrying a display name, and every
//! message frame a participant sends is attributed and broadcast back to all
//! connected participants, sender included.
//!
//! - [`server::message`] holds the binary wire protocol.
//! - [`server::registry`] keeps the ordered set of live sessions.
//! - [`server::relay`] owns the listener and the registry and dispatches events.
//! - [`config`] loads `RELAY_*` settings from the environment.

pub mod config;
pub mod server;
pub mod utils;
