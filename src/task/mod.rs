//! The per-row task model: typestate lifecycle and persisted transitions.

mod transitions;
mod types;

pub use types::*;
