//! # Realtime Sessions
//!
//! ## Key Components:
//! - **config**: per-session configuration negotiated through `session.update`
//! - **machine**: the socket-independent session state machine
//! - **registry**: process-wide index of live sessions and the concurrency cap

pub mod config;
pub mod machine;
pub mod registry;

pub use machine::{SessionEffect, SessionMachine};
pub use registry::SessionRegistry;
