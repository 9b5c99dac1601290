//! # Bus Demo
//!
//! A small desktop-style topology on the message bus:
//!
//! ```text
//!   controller (main, stream) ◀── on_tick ── ticker (thread)
//!        │ answer                              │
//!        ▼                                     │
//!   database (process, stream) ◀── fire ───────┘
//! ```
//!
//! The same binary is the worker program for the `database` process: when
//! started by a bus it serves the component instead of running a scenario.

pub mod components;
pub mod scenarios;

pub use components::{catalog, payload, Controller, Database, Ticker};
pub use scenarios::{register_topology, Report, CONTROLLER, DATABASE, TICKER};
