//! # Lectern Common Library
//!
//! Shared code for the lectern analysis engine including:
//! - Agent lifecycle event types and the EventBus
//! - Bootstrap configuration loading and root folder resolution
//! - Common error type

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
