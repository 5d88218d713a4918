pub mod benchmark;
pub mod capability;
pub mod config;
pub mod error;
pub mod executor;
pub mod gpu;
pub mod harness;
pub mod kernel;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod stats;
pub mod trace;
pub mod variant;

pub use error::{BenchError, Result};
