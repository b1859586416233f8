//! SimDrive Common - Shared types and utilities
//!
//! This crate provides the drive identity type, the store configuration and
//! the error type used by every SimDrive component.

pub mod config;
pub mod error;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use types::*;
