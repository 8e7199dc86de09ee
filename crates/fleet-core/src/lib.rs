//! Shared data model, error taxonomy, configuration, and the small
//! pure-logic helpers (path escaping, glob matching) used by both the
//! controller and agent binaries.

pub mod audit;
pub mod config;
pub mod error;
pub mod escape;
pub mod glob;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
