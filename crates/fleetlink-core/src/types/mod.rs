//! Core types for FleetLink.

mod identifiers;
mod teleop;

pub use identifiers::*;
pub use teleop::*;
