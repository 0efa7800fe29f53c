//! Cardvault Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration, clock and
//! record types shared by every Cardvault component.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
