//! # pulse-node
//!
//! Async runtime for the node agent. [`session`] owns the websocket and its
//! receive/heartbeat tasks, [`clock`] drives the accrual computation, and
//! [`node`] supervises both with the reconnect policy from `pulse-core`.

pub mod auth;
pub mod clock;
pub mod commands;
mod heartbeat;
pub mod logging;
pub mod node;
pub mod session;

pub use node::{Node, NodeError, Relogin, ReloginOutcome};
pub use session::{ConnectionState, Session, SessionConfig, SessionError};
