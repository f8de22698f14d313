//! webterm - browser terminal backend.
//!
//! Each WebSocket connection is bound to a session with its own sandbox
//! directory and environment. A handful of commands are answered from session
//! state; everything else runs through a shell with a timeout, an output cap
//! and a command blocklist.

pub mod builtins;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod http_server;
pub mod protocol;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod store;
pub mod terminal;
