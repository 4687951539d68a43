//! Domain model module declarations.

pub mod identity;
pub mod session;
