//! # corpmap common library
//!
//! Shared code for the corpmap services:
//! - Error type and result alias
//! - TOML configuration loading and root folder resolution
//! - Server-Sent Events helpers
//! - Timestamp utilities

pub mod config;
pub mod error;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
