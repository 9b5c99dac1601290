//! Queue Triplet
//!
//! Every registered name owns three FIFOs:
//!
//! ```text
//!            ┌──────────────── QueueTriplet ────────────────┐
//! order  ──▶ │ ctrl   : unbounded  ControlEnvelope          │ ──▶ control loop
//! answer ──▶ │                                              │
//! poll   ──▶ │ poll   : unbounded  ControlEnvelope          │ ──▶ poll loop
//! stream ──▶ │ stream : bounded    StreamEnvelope (try_send)│ ──▶ stream loop
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! The triplet outlives worker generations. Senders live only here, so
//! dropping the triplet disconnects every receiver a worker still holds.

use crossbeam_channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender, TrySendError};
use std::time::Duration;
use types::{CallEnvelope, ControlEnvelope, QueueClass, StreamEnvelope};

pub(crate) struct QueueTriplet {
    ctrl_tx: Sender<ControlEnvelope>,
    ctrl_rx: Receiver<ControlEnvelope>,
    poll_tx: Sender<ControlEnvelope>,
    poll_rx: Receiver<ControlEnvelope>,
    stream_tx: Sender<StreamEnvelope>,
    stream_rx: Receiver<StreamEnvelope>,
}

/// Consumer ends handed to one worker generation
#[derive(Clone)]
pub(crate) struct QueueReceivers {
    pub ctrl: Receiver<ControlEnvelope>,
    pub poll: Receiver<ControlEnvelope>,
    pub stream: Receiver<StreamEnvelope>,
}

/// Outcome of a non-blocking stream put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPush {
    Accepted,
    Full,
    Closed,
}

/// Calls removed from a queue that nobody will execute
pub(crate) struct Drained {
    pub calls: Vec<(QueueClass, CallEnvelope)>,
    pub stream_events: usize,
}

impl QueueTriplet {
    pub fn new(stream_capacity: usize) -> Self {
        let (ctrl_tx, ctrl_rx) = unbounded();
        let (poll_tx, poll_rx) = unbounded();
        let (stream_tx, stream_rx) = bounded(stream_capacity);
        Self {
            ctrl_tx,
            ctrl_rx,
            poll_tx,
            poll_rx,
            stream_tx,
            stream_rx,
        }
    }

    pub fn receivers(&self) -> QueueReceivers {
        QueueReceivers {
            ctrl: self.ctrl_rx.clone(),
            poll: self.poll_rx.clone(),
            stream: self.stream_rx.clone(),
        }
    }

    pub fn push_ctrl(&self, envelope: ControlEnvelope) -> bool {
        self.ctrl_tx.send(envelope).is_ok()
    }

    /// Time-bounded put on the poll queue
    pub fn push_poll(&self, envelope: ControlEnvelope, timeout: Duration) -> bool {
        match self.poll_tx.send_timeout(envelope, timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => false,
        }
    }

    /// Non-blocking put; a full queue rejects the newest envelope
    pub fn push_stream(&self, envelope: StreamEnvelope) -> StreamPush {
        match self.stream_tx.try_send(envelope) {
            Ok(()) => StreamPush::Accepted,
            Err(TrySendError::Full(_)) => StreamPush::Full,
            Err(TrySendError::Disconnected(_)) => StreamPush::Closed,
        }
    }

    /// Stream put that waits up to `timeout` for room
    pub fn push_stream_wait(&self, envelope: StreamEnvelope, timeout: Duration) -> bool {
        self.stream_tx.send_timeout(envelope, timeout).is_ok()
    }

    /// Enqueue a stop for worker generation `epoch` on all three queues
    ///
    /// The stream stop waits up to `stream_timeout` for room; a live stream
    /// loop frees space quickly and a dead one does not need the stop.
    pub fn send_stop(&self, epoch: u64, stream_timeout: Duration) {
        let _ = self.ctrl_tx.send(ControlEnvelope::Stop { epoch });
        let _ = self.poll_tx.send(ControlEnvelope::Stop { epoch });
        let _ = self
            .stream_tx
            .send_timeout(StreamEnvelope::Stop { epoch }, stream_timeout);
    }

    pub fn depth(&self, class: QueueClass) -> usize {
        match class {
            QueueClass::Ctrl => self.ctrl_rx.len(),
            QueueClass::Poll => self.poll_rx.len(),
            QueueClass::Stream => self.stream_rx.len(),
        }
    }

    /// Empty all three queues, keeping the calls so callers can be failed
    pub fn drain(&self) -> Drained {
        let mut calls = Vec::new();
        for (class, rx) in [(QueueClass::Ctrl, &self.ctrl_rx), (QueueClass::Poll, &self.poll_rx)] {
            for envelope in rx.try_iter() {
                if let ControlEnvelope::Call(call) = envelope {
                    calls.push((class, call));
                }
            }
        }
        let stream_events = self
            .stream_rx
            .try_iter()
            .filter(|envelope| matches!(envelope, StreamEnvelope::Event(_)))
            .count();
        Drained {
            calls,
            stream_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{Args, RequestId};

    #[test]
    fn test_stream_queue_rejects_when_full() {
        let queues = QueueTriplet::new(2);
        let event = || StreamEnvelope::event("tick", Args::new());
        assert_eq!(queues.push_stream(event()), StreamPush::Accepted);
        assert_eq!(queues.push_stream(event()), StreamPush::Accepted);
        assert_eq!(queues.push_stream(event()), StreamPush::Full);
        assert_eq!(queues.depth(QueueClass::Stream), 2);

        let rx = queues.receivers();
        rx.stream.recv().unwrap();
        assert_eq!(queues.push_stream(event()), StreamPush::Accepted);
    }

    #[test]
    fn test_ctrl_queue_is_fifo() {
        let queues = QueueTriplet::new(4);
        let ids: Vec<RequestId> = (0..5).map(|_| RequestId::new()).collect();
        for id in &ids {
            assert!(queues.push_ctrl(ControlEnvelope::call(*id, "ping", Args::new())));
        }
        let rx = queues.receivers();
        let seen: Vec<RequestId> = rx
            .ctrl
            .try_iter()
            .filter_map(|env| match env {
                ControlEnvelope::Call(call) => Some(call.id),
                ControlEnvelope::Stop { .. } => None,
            })
            .collect();
        assert_eq!(seen, ids);
    }

    #[test]
    fn test_drain_keeps_calls_and_drops_stops() {
        let queues = QueueTriplet::new(4);
        let id = RequestId::new();
        queues.push_ctrl(ControlEnvelope::call(id, "ping", Args::new()));
        queues.push_poll(
            ControlEnvelope::call(RequestId::new(), "ready", Args::new()),
            Duration::from_millis(10),
        );
        queues.push_stream(StreamEnvelope::event("tick", Args::new()));
        queues.send_stop(7, Duration::from_millis(10));

        let drained = queues.drain();
        assert_eq!(drained.calls.len(), 2);
        assert_eq!(drained.calls[0].0, QueueClass::Ctrl);
        assert_eq!(drained.calls[0].1.id, id);
        assert_eq!(drained.stream_events, 1);
        for class in QueueClass::ALL {
            assert_eq!(queues.depth(class), 0);
        }
    }
}
