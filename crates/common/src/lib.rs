//! Common utilities for recovery-usb
//!
//! This crate provides functionality shared between the host library and the
//! command line tool: logging setup and the top-level error type.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{directives_for, setup_logging};
