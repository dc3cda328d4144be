//! Omnara relay core: frame codec, credential verification, session registry,
//! PTY bridge, env configuration. No HTTP handlers, no UI.

pub mod auth;
pub mod config;
pub mod frame;
pub mod history;
pub mod pty;
pub mod session;
