//! Container execution core for fclocal
//!
//! This crate provides:
//! - Runtime image resolution with a memoized registry probe
//! - Container descriptors for install, invoke, start and sandbox modes
//! - Container lifecycle management (create, run, start, exec, stop)
//! - Stream demultiplexing and interactive terminal bridging
//! - Image pull/build with progress and log folding
//! - Coordinated teardown of in-flight containers on interrupt

mod error;
mod image;
mod invoke;
mod manager;
mod platform;
pub mod spec;
mod shutdown;
pub mod stream;

pub use error::*;
pub use image::*;
pub use invoke::*;
pub use manager::*;
pub use platform::*;
pub use shutdown::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
