//! Message Bus
//!
//! [`Bus`] owns every queue triplet, both result tables, all worker
//! generations, the process manager and the shared state map. Components
//! reach it through [`BusHandle`]s, which hold only a weak reference.
//!
//! ```text
//!                ┌────────────────────── Bus ──────────────────────┐
//! BusHandle ────▶│ Registry: name ─▶ ComponentSlot                 │
//!  (verbs)       │              ├─ QueueTriplet (ctrl/poll/stream) │
//!                │              ├─ instance + worker generation    │
//!                │              └─ lifecycle, epoch               │
//!                │ ResultTables (ctrl, poll, chunk assembly)       │
//!                │ in_flight ids · ResponseChecker · SharedState   │
//!                │ ProcessManager · shutdown flags                 │
//!                └─────────────────────────────────────────────────┘
//! ```
//!
//! # Lock Ordering
//!
//! registry → slot state → instance → result tables / assembler.
//! The registry lock is never held across a put or a join; a slot's state
//! lock is held for the whole of a lifecycle transition.

use crate::checker::ResponseChecker;
use crate::error::{BusError, Result};
use crate::handle::BusHandle;
use crate::hosted::{Catalog, Component};
use crate::metrics::{BusMetrics, BusStats};
use crate::process::manager::ProcessManager;
use crate::registry::{ComponentInfo, ComponentSlot, Registry, Workers};
use crate::results::{ResultTableSizes, ResultTables};
use crate::shared_state::{SharedState, SharedStateHandle};
use crate::shutdown::{self, ShutdownFlags};
use crate::supervisor::{self, Lifecycle};
use bus_config::BusConfig;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info};
use types::{Args, ComponentKind, RequestId};

/// How a registration proceeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Start workers immediately
    pub start: bool,
    /// Run a stream loop and accept `stream` events
    pub stream: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            start: true,
            stream: false,
        }
    }
}

impl RegisterOptions {
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Register without starting workers
    pub fn deferred(mut self) -> Self {
        self.start = false;
        self
    }
}

pub(crate) struct BusCore {
    pub(crate) config: BusConfig,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) registry: Registry,
    pub(crate) results: Arc<ResultTables>,
    pub(crate) in_flight: Arc<DashMap<RequestId, Instant>>,
    pub(crate) outgoing: AtomicU64,
    pub(crate) checker: Mutex<Option<ResponseChecker>>,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) processes: ProcessManager,
    pub(crate) flags: ShutdownFlags,
    pub(crate) metrics: Arc<BusMetrics>,
    pub(crate) self_ref: Weak<BusCore>,
}

impl BusCore {
    pub(crate) fn shared_state(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }
}

pub struct Bus {
    core: Arc<BusCore>,
}

impl Bus {
    pub fn new(config: BusConfig) -> Result<Self> {
        Self::with_catalog(config, Catalog::new())
    }

    /// Build a bus whose catalog already knows the given classes
    pub fn with_catalog(config: BusConfig, catalog: Catalog) -> Result<Self> {
        config.validate()?;

        let results = Arc::new(ResultTables::new(config.lock_timeout()));
        let in_flight = Arc::new(DashMap::new());
        let metrics = Arc::new(BusMetrics::default());
        let checker = ResponseChecker::start(
            Arc::clone(&results),
            Arc::clone(&in_flight),
            Arc::clone(&metrics),
            &config,
        )
        .map_err(|e| BusError::spawn_with_source("bus-response-checker", "checker thread", e))?;

        let core = Arc::new_cyclic(|self_ref| BusCore {
            shared: Arc::new(SharedState::new(config.shared_state_lock_timeout())),
            processes: ProcessManager::new(&config),
            catalog: RwLock::new(catalog),
            registry: Registry::default(),
            results,
            in_flight,
            outgoing: AtomicU64::new(0),
            checker: Mutex::new(Some(checker)),
            flags: ShutdownFlags::default(),
            metrics,
            self_ref: self_ref.clone(),
            config,
        });
        info!(
            answer_timeout_ms = core.config.answer_timeout_ms,
            stream_capacity = core.config.stream_capacity,
            chunk_threshold = core.config.chunk_threshold,
            "Message bus created"
        );
        Ok(Self { core })
    }

    /// Handle for callers outside any component
    pub fn handle(&self) -> BusHandle {
        BusHandle::local(Arc::downgrade(&self.core), None)
    }

    /// Handle that originates traffic as component `name`
    pub fn handle_as(&self, name: &str) -> BusHandle {
        BusHandle::local(Arc::downgrade(&self.core), Some(Arc::from(name)))
    }

    pub fn config(&self) -> &BusConfig {
        &self.core.config
    }

    /// Make `C` constructible by class name
    pub fn add_class<C: Component>(&self) {
        self.core.catalog.write().add::<C>();
    }

    /// Register `name` as an instance of `C`
    pub fn register<C: Component>(
        &self,
        name: &str,
        kind: ComponentKind,
        options: RegisterOptions,
        args: Args,
    ) -> Result<()> {
        self.add_class::<C>();
        self.register_class(name, C::CLASS, kind, options, args)
    }

    /// Register `name` as an instance of a catalog class
    ///
    /// Re-registering keeps the queues and the kind, stops the running
    /// generation and replaces the instance. A different kind fails before
    /// anything is constructed.
    pub fn register_class(
        &self,
        name: &str,
        class: &str,
        kind: ComponentKind,
        options: RegisterOptions,
        args: Args,
    ) -> Result<()> {
        if self.core.flags.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        self.core.registry.check_kind(name, kind)?;

        let catalog = self.core.catalog.read().clone();
        let instance = catalog.construct(name, class, self.handle_as(name), &args)?;
        let instance = Arc::new(Mutex::new(instance));

        loop {
            let slot = self.core.registry.get_or_insert(name, kind, self.core.config.stream_capacity)?;
            let mut state = slot.state.lock();
            if state.removed {
                // Lost a race with unregister; the next lookup creates a fresh slot
                continue;
            }
            if state.workers.is_some() {
                supervisor::stop_workers(&self.core, &slot, &mut state);
            }

            state.class = class.to_string();
            state.args = args;
            state.stream_enabled = options.stream;
            state.instance = Some(instance);
            slot.set_stream_enabled(options.stream);
            slot.set_lifecycle(Lifecycle::Registered);
            info!(component = %name, kind = %kind, class = %class, "Component registered");

            if options.start {
                supervisor::start_component(&self.core, &slot, &mut state)?;
            }
            return Ok(());
        }
    }

    /// Stop, drain and remove `name`
    pub fn unregister(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        if state.removed {
            return Err(BusError::not_registered(name));
        }
        supervisor::stop_workers(&self.core, &slot, &mut state);
        supervisor::drain_component(&self.core, &slot);
        state.removed = true;
        state.instance = None;
        drop(state);

        self.core.registry.remove_if_same(name, &slot);
        info!(component = %name, "Component unregistered");
        Ok(())
    }

    /// Start workers; a running component is restarted
    pub fn start(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        if state.removed {
            return Err(BusError::not_registered(name));
        }
        supervisor::start_component(&self.core, &slot, &mut state)
    }

    /// Stop workers, keeping queued envelopes for the next start
    pub fn stop(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        supervisor::stop_workers(&self.core, &slot, &mut state);
        Ok(())
    }

    /// Stop workers and drain the queues, failing calls still awaited
    pub fn stop_and_drain(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        supervisor::stop_workers(&self.core, &slot, &mut state);
        supervisor::drain_component(&self.core, &slot);
        Ok(())
    }

    fn slot(&self, name: &str) -> Result<Arc<ComponentSlot>> {
        self.core
            .registry
            .get(name)
            .ok_or_else(|| BusError::not_registered(name))
    }

    /// All enabled worker loops of `name` are alive
    ///
    /// Never waits on a slot busy in a lifecycle transition.
    pub fn running(&self, name: &str) -> bool {
        self.workers_alive(name, |workers| workers.is_alive())
    }

    pub fn stream_running(&self, name: &str) -> bool {
        self.workers_alive(name, |workers| workers.stream_alive())
            && self.core.registry.get(name).is_some_and(|slot| slot.stream_enabled())
    }

    fn workers_alive(&self, name: &str, alive: impl FnOnce(&mut Workers) -> bool) -> bool {
        let Some(slot) = self.core.registry.get(name) else {
            return false;
        };
        if slot.lifecycle() != Lifecycle::Running {
            return false;
        }
        let alive = match slot.state.try_lock() {
            Some(mut state) => state.workers.as_mut().is_some_and(alive),
            None => true,
        };
        alive
    }

    /// Lifecycle state; `None` when not registered
    pub fn state(&self, name: &str) -> Option<Lifecycle> {
        self.core.registry.get(name).map(|slot| slot.lifecycle())
    }

    pub fn list(&self) -> BTreeMap<String, ComponentInfo> {
        self.core
            .registry
            .snapshot()
            .into_iter()
            .map(|slot| {
                let mut state = slot.state.try_lock_for(self.core.config.lock_timeout());
                let info = ComponentInfo::capture(&slot, state.as_deref_mut());
                (slot.name.to_string(), info)
            })
            .collect()
    }

    /// Run `f` on the live instance of `name`
    ///
    /// For process components this is the parent-side reference instance,
    /// not the one serving calls.
    pub fn with_instance<C: Component, R>(&self, name: &str, f: impl FnOnce(&mut C) -> R) -> Result<R> {
        let slot = self.slot(name)?;
        let instance = slot
            .state
            .lock()
            .instance
            .clone()
            .ok_or_else(|| BusError::not_registered(name))?;
        let mut hosted = instance.lock();
        let component = hosted
            .as_any_mut()
            .downcast_mut::<C>()
            .ok_or_else(|| BusError::WrongClass {
                name: name.to_string(),
                expected: C::CLASS,
            })?;
        Ok(f(component))
    }

    pub fn result_table_sizes(&self) -> ResultTableSizes {
        self.core.results.sizes()
    }

    /// Ids currently awaited by `answer`, `poll` or `answer_async`
    pub fn awaited_requests(&self) -> usize {
        self.core.in_flight.len()
    }

    pub fn shared(&self) -> SharedStateHandle {
        SharedStateHandle::local(self.core.shared_state())
    }

    pub fn metrics(&self) -> BusStats {
        self.core.metrics.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.core.flags.is_shutting_down()
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.core.flags.is_complete()
    }

    /// Process manager still accepts spawns
    pub fn manager_alive(&self) -> bool {
        self.core.processes.is_alive()
    }

    /// Graceful shutdown; later calls wait for the first to finish
    pub fn shutdown(&self) {
        shutdown::graceful(&self.core);
    }

    /// Shut down gracefully on SIGINT/SIGTERM, exiting the process afterwards
    /// when `exit_on_signal` is set
    pub fn install_signal_handlers(&self, exit_on_signal: bool) -> Result<()> {
        shutdown::install_signal_handlers(Arc::downgrade(&self.core), exit_on_signal)
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if self.core.flags.is_complete() {
            return;
        }
        if self.core.flags.is_started() {
            debug!("Bus dropped during shutdown");
        }
        shutdown::emergency(&self.core);
    }
}
