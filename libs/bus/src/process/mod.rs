//! Process-kind components
//!
//! ```text
//!        parent                                   worker process
//! ┌──────────────────────┐   unix socket    ┌──────────────────────────┐
//! │ ctrl   ─▶ forwarder ─┼──── Deliver ────▶│ link reader ─▶ ctrl      │
//! │ poll   ─▶ forwarder ─┼──── Deliver ────▶│             ─▶ poll      │
//! │ stream ─▶ forwarder ─┼──── Deliver ────▶│             ─▶ stream    │
//! │                      │                  │   worker loops           │
//! │ result tables ◀──────┼──── Result ──────┼── RemoteSink             │
//! │ verbs / shared state ◀┼─── Verb/State ───┼── BusHandle (remote)     │
//! └──────────────────────┘                  └──────────────────────────┘
//! ```
//!
//! The parent keeps the queue triplet; the worker process rebuilds the
//! instance from class name and args and runs the ordinary worker loops
//! against queues of its own.

pub mod child;
pub(crate) mod host;
pub(crate) mod manager;
pub mod protocol;
