//! Component Registry
//!
//! Name → [`ComponentSlot`]. A slot is created on first registration and
//! keeps its queue triplet and hosting kind until the name is unregistered;
//! instances and worker generations come and go inside it.
//!
//! # Lock Ordering
//!
//! `slots` (registry) before any slot's `state`. The registry lock is only
//! held for map lookups and inserts, never across a put or a join.

use crate::error::{BusError, Result};
use crate::process::host::ProcessWorker;
use crate::queues::QueueTriplet;
use crate::supervisor::Lifecycle;
use crate::worker::{SharedInstance, WorkerThreads};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use types::{Args, ComponentKind, QueueClass};

/// Running worker generation of a component
pub(crate) enum Workers {
    Threads(WorkerThreads),
    Process(ProcessWorker),
}

impl Workers {
    pub fn epoch(&self) -> u64 {
        match self {
            Workers::Threads(threads) => threads.control().epoch(),
            Workers::Process(process) => process.control().epoch(),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        match self {
            Workers::Threads(threads) => threads.all_alive(),
            Workers::Process(process) => process.is_alive(),
        }
    }

    pub fn stream_alive(&mut self) -> bool {
        match self {
            Workers::Threads(threads) => threads.stream_alive(),
            Workers::Process(process) => process.stream_alive(),
        }
    }
}

/// Mutable part of a slot, replaced wholesale by re-registration
pub(crate) struct SlotState {
    pub class: String,
    pub args: Args,
    pub stream_enabled: bool,
    /// Live instance; for process components a parent-side reference only
    pub instance: Option<SharedInstance>,
    pub workers: Option<Workers>,
    /// Set once unregistered; a registration racing with removal retries
    pub removed: bool,
}

pub(crate) struct ComponentSlot {
    pub name: Arc<str>,
    pub kind: ComponentKind,
    pub queues: QueueTriplet,
    pub state: Mutex<SlotState>,
    lifecycle: AtomicU8,
    stream_enabled: AtomicBool,
    stream_overflow: AtomicBool,
    epoch: AtomicU64,
}

impl ComponentSlot {
    fn new(name: &str, kind: ComponentKind, stream_capacity: usize) -> Self {
        Self {
            name: Arc::from(name),
            kind,
            queues: QueueTriplet::new(stream_capacity),
            state: Mutex::new(SlotState {
                class: String::new(),
                args: Args::new(),
                stream_enabled: false,
                instance: None,
                workers: None,
                removed: false,
            }),
            lifecycle: AtomicU8::new(Lifecycle::Registered as u8),
            stream_enabled: AtomicBool::new(false),
            stream_overflow: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    /// Epoch for the next worker generation
    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::SeqCst);
    }

    pub fn stream_enabled(&self) -> bool {
        self.stream_enabled.load(Ordering::SeqCst)
    }

    pub fn set_stream_enabled(&self, enabled: bool) {
        self.stream_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Track overflow transitions; returns the previous value
    pub fn mark_stream_overflow(&self, overflowing: bool) -> bool {
        self.stream_overflow.swap(overflowing, Ordering::Relaxed)
    }
}

/// Snapshot of one component, as returned by [`crate::Bus::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentInfo {
    pub kind: ComponentKind,
    pub class: String,
    pub state: Lifecycle,
    pub running: bool,
    pub stream_enabled: bool,
    pub stream_running: bool,
    pub ctrl_depth: usize,
    pub poll_depth: usize,
    pub stream_depth: usize,
}

impl ComponentInfo {
    pub(crate) fn capture(slot: &ComponentSlot, state: Option<&mut SlotState>) -> Self {
        let (class, running, stream_running) = match state {
            Some(state) => {
                let (running, stream_running) = match state.workers.as_mut() {
                    Some(workers) => (workers.is_alive(), workers.stream_alive()),
                    None => (false, false),
                };
                (state.class.clone(), running, stream_running)
            }
            // Slot busy in a lifecycle transition; fall back to lock-free fields
            None => {
                let running = slot.lifecycle() == Lifecycle::Running;
                (String::new(), running, running && slot.stream_enabled())
            }
        };
        Self {
            kind: slot.kind,
            class,
            state: slot.lifecycle(),
            running,
            stream_enabled: slot.stream_enabled(),
            stream_running,
            ctrl_depth: slot.queues.depth(QueueClass::Ctrl),
            poll_depth: slot.queues.depth(QueueClass::Poll),
            stream_depth: slot.queues.depth(QueueClass::Stream),
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    slots: Mutex<HashMap<String, Arc<ComponentSlot>>>,
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<Arc<ComponentSlot>> {
        self.slots.lock().get(name).cloned()
    }

    /// Fail if `name` exists with a different kind
    pub fn check_kind(&self, name: &str, kind: ComponentKind) -> Result<()> {
        match self.slots.lock().get(name) {
            Some(slot) if slot.kind != kind => Err(BusError::ConflictingKind {
                name: name.to_string(),
                existing: slot.kind,
                requested: kind,
            }),
            _ => Ok(()),
        }
    }

    pub fn get_or_insert(
        &self,
        name: &str,
        kind: ComponentKind,
        stream_capacity: usize,
    ) -> Result<Arc<ComponentSlot>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(name) {
            if slot.kind != kind {
                return Err(BusError::ConflictingKind {
                    name: name.to_string(),
                    existing: slot.kind,
                    requested: kind,
                });
            }
            return Ok(Arc::clone(slot));
        }
        let slot = Arc::new(ComponentSlot::new(name, kind, stream_capacity));
        slots.insert(name.to_string(), Arc::clone(&slot));
        Ok(slot)
    }

    /// Remove `name` only if it still maps to `slot`
    pub fn remove_if_same(&self, name: &str, slot: &Arc<ComponentSlot>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(name) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                slots.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<ComponentSlot>> {
        self.slots.lock().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove every slot; queues close once the last reference drops
    pub fn clear(&self) -> Vec<Arc<ComponentSlot>> {
        self.slots.lock().drain().map(|(_, slot)| slot).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}
