//! # Fynx Platform
//!
//! Core platform types shared by the Fynx protocol crates.
//!
//! This crate provides:
//! - Unified error types (`FynxError`, `FynxResult`)
//! - Error classification used to decide between tearing down a session and
//!   failing a single channel
//!
//! # Examples
//!
//! ```
//! use fynx_platform::{FynxError, FynxResult};
//!
//! fn example_function() -> FynxResult<String> {
//!     Ok("Hello, Fynx!".to_string())
//! }
//!
//! # fn main() -> FynxResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Fynx!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{FynxError, FynxResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
