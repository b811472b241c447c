//! Core Module
//!
//! Shared infrastructure for the handles and streams: the error type and the
//! engine layer that owns SQLite connections.
pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{Result, RxError};
