//! FAC Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the FAC merge pipeline workspace.
//!
//! # Overview
//!
//! - **Logging**: one place to initialize `tracing` for every binary
//! - **Checksums**: streaming SHA-256 digests used to fingerprint run artifacts
//! - **Errors**: the error type for the utilities above
//!
//! # Example
//!
//! ```no_run
//! use fac_common::checksum::compute_file_sha256;
//!
//! fn fingerprint(path: &str) -> fac_common::Result<()> {
//!     let digest = compute_file_sha256(path)?;
//!     println!("{path}: {digest}");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
