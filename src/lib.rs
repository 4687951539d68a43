#![forbid(unsafe_code)]

//! Per-user ephemeral sandbox sessions.
//!
//! Each session is driven by a [`orchestrator::SessionController`] that
//! boots an isolated sandbox on demand, relays browser terminal streams
//! into it, and tears it down on request or after a period of inactivity.

pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod policy;
pub mod relay;
pub mod sandbox;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
