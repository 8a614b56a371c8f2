//! Upgraded stream connections

pub mod engine;
pub mod handles;

pub use engine::{Connection, Phase, run};
pub use handles::{Handle, HandleTable};
