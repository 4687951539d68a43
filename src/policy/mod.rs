//! Authorization policy.

pub mod evaluator;

pub use evaluator::{AuthorizationGate, Decision};
