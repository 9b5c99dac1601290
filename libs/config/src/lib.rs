//! # Message Bus Configuration
//!
//! Process-wide settings for the message bus: correlation timeouts, queue
//! capacities, chunking threshold, worker loop backoff and supervisor
//! escalation timings.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bus_config::BusConfig;
//!
//! let config = BusConfig::load(None)?;
//! let timeout = config.answer_timeout();
//! # Ok::<(), bus_config::ConfigError>(())
//! ```

pub mod bus_config;
pub mod defaults;
pub mod error;

pub use crate::bus_config::BusConfig;
pub use error::{ConfigError, Result};
