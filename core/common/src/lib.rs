//! Common utilities and types shared across FieldSync modules.
//!
//! This module provides the error taxonomy and the small value types used by
//! the storage layer and the sync core.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::StoreKey;
