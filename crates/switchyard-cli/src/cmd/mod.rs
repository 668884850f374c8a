//! Command implementations by domain.

pub mod deploy;
pub mod node;
