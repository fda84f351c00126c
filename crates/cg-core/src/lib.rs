//! cg-core: CampusGo client core library
//!
//! Shared configuration and error types for the CampusGo session client
//! crates.

pub mod config;
pub mod error;

pub use config::{ApiConfig, AuthConfig, Config, StorageConfig, UnauthorizedRetryPolicy};
pub use error::{Error, Result};
