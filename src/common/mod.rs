//! Common utilities and types

pub mod error;

pub use error::{ConfigError, Error, ProcessError, Result};
