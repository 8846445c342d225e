//! # spindle-core - shared leaf types
//!
//! Types shared by every crate in the spindle workspace: the error and
//! resume-value model, shared byte buffers, leveled logging, and env
//! parsing helpers. This crate has no dependencies and no I/O of its own.

pub mod buffer;
pub mod env;
pub mod error;
pub mod klog;
pub mod resume;

pub use buffer::Buffer;
pub use env::{env_get, env_get_bool};
pub use error::{Error, Result};
pub use klog::LogLevel;
pub use resume::{Interrupt, Resume, Token};
