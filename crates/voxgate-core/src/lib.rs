//! # voxgate-core
//!
//! Core types, wire messages, configuration, and error handling shared by the
//! voxgate session coordinator and its host.

pub mod config;
pub mod error;
pub mod message;
pub mod types;

pub use config::{CaptureConfig, Config, PlaybackConfig};
pub use error::{Error, Result};
pub use types::*;
