//! Omnara wrapper: agent lookup, relay client, and the PTY run loop.

pub mod agent;
pub mod relay_client;
pub mod session;
