//! Durable key/value storage for FieldSync.
//!
//! This module provides a trait-based interface for the byte stores that back
//! the entity cache and the pending-action queue, plus a typed configuration
//! for choosing and opening a backend.
//!
//! # Design Principles
//! - Backend isolation: the sync core only sees `KeyValueStore`
//! - Async operations: all I/O operations are async
//! - Atomic records: a `set` either fully replaces a record or leaves it untouched
//! - Unified error semantics: backend failures surface as `Error::Storage` or `Error::Io`

pub mod config;
pub mod local;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use config::StoreConfig;
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{get_json, set_json, KeyValueStore};
