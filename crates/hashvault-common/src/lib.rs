//! Hashvault Common Library
//!
//! Shared types, utilities, and error handling for the Hashvault workspace.
//!
//! # Overview
//!
//! - **Types**: the `HASH:COUNT` record, line validation and hash normalization
//! - **Error Handling**: record rejection reasons and the common error type
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```
//! use hashvault_common::types::{parse_line, DEFAULT_HASH_LENGTH};
//!
//! let record = parse_line("5baa61e4c9b93f3f0682250b6cf8331b7ee68fd8:3", Some(DEFAULT_HASH_LENGTH))?;
//! assert_eq!(record.hash, "5BAA61E4C9B93F3F0682250B6CF8331B7EE68FD8");
//! assert_eq!(record.count, 3);
//! # Ok::<(), hashvault_common::RecordError>(())
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{HashvaultError, RecordError, Result};
pub use types::HashRecord;
