//! Common types and utilities shared across Cascade components.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};

/// Re-export commonly used external types
pub use bytes::Bytes;
pub use uuid::Uuid;
