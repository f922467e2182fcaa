//! Control-plane core of a software packet switch.
//!
//! The crate manages ports, components and worker cores and commits
//! configuration changes to running workers without locks, through a
//! per-core double-buffered hand-off. Per-packet processing and port
//! back-ends plug in through the [`worker::PacketLoop`] and
//! [`flush::PortDriver`] seams.

pub mod component;
pub mod config;
pub mod core_state;
pub mod flush;
pub mod port;
pub mod state;
pub mod test_util;
pub mod tracker;
pub mod worker;

pub use config::SwitchConfig;
pub use state::{RequestError, SwitchState};
