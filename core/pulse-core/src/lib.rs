//! # pulse-core
//!
//! Synchronous building blocks for the pulse node agent: the persisted
//! snapshot and its store, the accrual clock computation, reconnect backoff,
//! account persistence and configuration.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The node runtime drives
//!   these from its own tasks.
//! - **Graceful degradation**: Missing or corrupt state files read as empty
//!   values, never as errors.
//! - **Disk is authoritative**: The store performs a full read-modify-write on
//!   every merge; nothing is cached between calls.

pub mod account;
pub mod accrual;
pub mod backoff;
pub mod config;
pub mod error;
pub mod snapshot;
pub mod storage;
pub mod store;

pub use account::{clear_account, load_account, save_account, AccountRecord};
pub use accrual::{Accrual, BonusSource, Countdown, NoBonus, RandomBonus};
pub use backoff::ReconnectPolicy;
pub use config::{load_config, AgentConfig};
pub use error::{PulseError, Result};
pub use snapshot::{fields, Snapshot};
pub use storage::StorageConfig;
pub use store::StateStore;
