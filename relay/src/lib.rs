//! Omnara relay server: axum HTTP + WebSocket fan-out between agent-side
//! wrappers (`/agent`) and remote viewers (`/terminal`).

mod reaper;
mod server;
mod upstream;
mod viewer;

pub use server::{run_relay_server, CredentialVerifier, RelayState};
