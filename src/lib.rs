//! Confluence Sniper Library
//!
//! Turns multi-source alpha signals into risk-bounded positions:
//! signal -> score -> validate -> size -> execute -> monitor -> settle.

pub mod aggregator;
pub mod alert;
pub mod allocator;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod pipeline;
pub mod position;
pub mod risk;
pub mod signal;
pub mod store;
pub mod validator;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
