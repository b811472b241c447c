//! Database Module
//!
//! The engine layer beneath the stream handles:
//! - **Engine Worker** (`engine.rs`): one thread per connection that owns the
//!   `rusqlite::Connection` and answers commands through callbacks
//! - **Values** (`value.rs`): owned values, parameters and rows exchanged
//!   with the worker
pub(crate) mod engine;
pub mod value;

pub use value::{Params, Row, RunResult, Value};
