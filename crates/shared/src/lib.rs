//! Paymirror shared utilities
//!
//! Database pool setup and migrations used by the API server and the worker.

pub mod db;
pub mod error;

pub use db::*;
pub use error::*;
