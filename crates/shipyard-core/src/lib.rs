pub mod config;
pub mod issue;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod steps;
pub mod types;

pub use types::*;
