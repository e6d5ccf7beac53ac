//! Controller dispatch stage
//!
//! Translates channel configs into `SET_CHANNEL` commands with per-node
//! cooldown and identical-config dedupe gates.

mod dispatch;

pub use dispatch::{ControllerConfig, Dispatcher};
