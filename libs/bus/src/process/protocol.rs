//! Worker socket messages
//!
//! Each direction carries one enum, framed by [`codec::FrameWriter`]:
//! [`ParentFrame`] parent → worker, [`ChildFrame`] worker → parent.
//! Verb and shared-state requests from the worker carry a `call_id` that the
//! matching reply echoes.

use crate::shared_state::{SharedStateError, StateOp};
use bus_config::BusConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use types::{Args, ControlEnvelope, PollResult, RequestId, ResultEnvelope, StreamEnvelope, Value};

/// Environment variable holding the socket path a worker connects to
pub const CHILD_SOCKET_ENV: &str = "MESSAGING_BUS_CHILD_SOCKET";

/// Everything a worker needs to rebuild its instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub name: String,
    pub class: String,
    pub args: Args,
    pub stream_enabled: bool,
    pub epoch: u64,
    pub config: BusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delivery {
    Ctrl(ControlEnvelope),
    Poll(ControlEnvelope),
    Stream(StreamEnvelope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParentFrame {
    Bootstrap(Bootstrap),
    Deliver(Delivery),
    VerbReply {
        call_id: u64,
        reply: VerbReply,
    },
    StateReply {
        call_id: u64,
        reply: Result<Value, SharedStateError>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultFrame {
    Ctrl(ResultEnvelope),
    Poll(PollResult),
}

/// A verb originated by the hosted instance inside the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VerbRequest {
    Order {
        target: String,
        method: String,
        args: Args,
    },
    Answer {
        target: String,
        method: String,
        args: Args,
        timeout_ms: Option<u64>,
    },
    Poll {
        target: String,
        method: String,
        args: Args,
        timeout_ms: Option<u64>,
    },
    Stream {
        target: String,
        func: String,
        args: Args,
    },
    Broadcast {
        method: String,
        args: Args,
        exclude: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VerbReply {
    RequestId(Option<RequestId>),
    Value(Option<Value>),
    Accepted(bool),
    Broadcast(BTreeMap<String, RequestId>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildFrame {
    Ready,
    Failed { message: String },
    Result(ResultFrame),
    Verb { call_id: u64, request: VerbRequest },
    State { call_id: u64, op: StateOp },
    /// Stream events taken off the worker's queue since the last credit
    StreamCredit { consumed: u32 },
    Exiting,
}
