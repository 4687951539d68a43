//! Session orchestration.
//!
//! Covers the per-session lifecycle controller, the idle monitor that
//! stops abandoned sessions, and the registry that indexes controllers
//! by session id.

pub mod controller;
pub mod idle_monitor;
pub mod registry;

pub use controller::{ControllerContext, ControllerSettings, SessionController, StreamGrant};
pub use registry::ControllerRegistry;
