//! Configuration parsing for fclocal
//!
//! This crate handles parsing of:
//! - Global configuration (`~/.config/fclocal/config.toml`)
//! - Function properties (handler, runtime, environment, NAS) from TOML or JSON

mod error;
mod function;
mod global;

pub use error::*;
pub use function::*;
pub use global::*;
