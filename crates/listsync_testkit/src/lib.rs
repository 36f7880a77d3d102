//! # listsync Testkit
//!
//! Test utilities for listsync.
//!
//! This crate provides:
//! - [`FaultyPrimaryStore`] and [`FlakySearchIndex`], adapters that fail,
//!   stall or lose work on command
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use listsync_testkit::prelude::*;
//!
//! let index = Arc::new(FlakySearchIndex::new());
//! index.fail_next(2);
//! // ... the first two index writes now fail
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::generators::*;
}

pub use faults::*;
pub use generators::*;
