//! Data models shared across the crate.
//!
//! This module re-exports all model types used throughout the library.

pub mod connection;
pub mod event;
pub mod query;

// Re-export commonly used types
pub use connection::{DatabaseDriver, IsolationMode, PlaceholderStyle};
pub use event::QueryEvent;
pub use query::{QueryParam, Row};
