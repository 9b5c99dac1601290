//! # Messaging Bus
//!
//! Named components, hosted in the caller's context, a dedicated thread or
//! a dedicated process, calling each other through five verbs:
//!
//! - `order`: fire-and-forget on the control queue, returns the request id
//! - `answer`: request/response on the control queue with a timeout
//! - `poll`: best-effort request/response on the poll queue
//! - `stream`: one-way event on the bounded stream queue
//! - `broadcast`: `order` to every other component
//!
//! ## Architecture
//!
//! ```text
//!  BusHandle ──verb──▶ QueueTriplet[target] ──▶ worker loops ──▶ hosted object
//!      ▲                                             │
//!      └──── wait / ResponseChecker ◀── ResultTables ◀┘ (chunked if large)
//! ```
//!
//! Process components run the same worker loops inside a child process
//! spawned from the worker program; see [`process`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let bus = Bus::new(BusConfig::default())?;
//! bus.register::<Database>("db", ComponentKind::Thread, RegisterOptions::default(), args![])?;
//! let pong = bus.handle().answer("db", "ping", args![]);
//! bus.shutdown();
//! ```

pub mod bus;
mod checker;
mod correlation;
pub mod error;
pub mod handle;
pub mod hosted;
pub mod metrics;
pub mod process;
mod queues;
pub mod registry;
pub mod results;
pub mod shared_state;
mod shutdown;
pub mod supervisor;
mod worker;

pub use crate::bus::{Bus, RegisterOptions};
pub use error::{BusError, Result};
pub use handle::{AnswerCallback, BusHandle};
pub use hosted::{host, CallError, Catalog, Component, HostedObject, MethodTable};
pub use metrics::BusStats;
pub use process::child;
pub use registry::ComponentInfo;
pub use results::ResultTableSizes;
pub use shared_state::{SharedStateError, SharedStateHandle, StateOp};
pub use supervisor::Lifecycle;

pub use bus_config::BusConfig;
pub use types::{args, Args, ComponentKind, FromValue, QueueClass, RequestId, Value, ValueError};
