//! Bus Handle
//!
//! The five originating verbs. Every hosted instance receives a handle at
//! construction; callers outside the bus get one from [`crate::Bus::handle`].
//!
//! | Verb        | Queue  | Waits | Returns                         |
//! |-------------|--------|-------|---------------------------------|
//! | `order`     | ctrl   | no    | request id                      |
//! | `answer`    | ctrl   | yes   | result value                    |
//! | `poll`      | poll   | yes   | result value (best effort)      |
//! | `stream`    | stream | no    | accepted                        |
//! | `broadcast` | ctrl   | no    | name → request id               |
//!
//! No verb returns an error: failures are logged and surface as `None` or
//! `false`. A handle holds only a weak reference to the bus, so instances
//! never keep the bus alive.

use crate::bus::BusCore;
use crate::process::child::ChildLink;
use crate::shared_state::SharedStateHandle;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;
use types::{Args, RequestId, Value};

/// Completion callback of [`BusHandle::answer_async`]
pub type AnswerCallback = Box<dyn FnOnce(Option<Value>) + Send + 'static>;

#[derive(Clone)]
enum Route {
    /// Same address space as the bus
    Local(Weak<BusCore>),
    /// Inside a worker process; verbs travel through the parent
    Remote(Arc<ChildLink>),
    Detached,
}

#[derive(Clone)]
pub struct BusHandle {
    origin: Option<Arc<str>>,
    route: Route,
}

impl BusHandle {
    pub(crate) fn local(core: Weak<BusCore>, origin: Option<Arc<str>>) -> Self {
        Self {
            origin,
            route: Route::Local(core),
        }
    }

    pub(crate) fn remote(link: Arc<ChildLink>) -> Self {
        Self {
            origin: Some(Arc::from(link.name())),
            route: Route::Remote(link),
        }
    }

    /// A handle bound to no bus; every verb fails
    pub fn detached() -> Self {
        Self {
            origin: None,
            route: Route::Detached,
        }
    }

    /// Name of the component this handle belongs to
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    fn core(&self) -> Option<Arc<BusCore>> {
        match &self.route {
            Route::Local(weak) => {
                let core = weak.upgrade();
                if core.is_none() {
                    debug!(origin = ?self.origin, "Bus dropped, verb ignored");
                }
                core
            }
            _ => None,
        }
    }

    /// Fire-and-forget call on the control queue
    pub fn order(&self, target: &str, method: &str, args: Args) -> Option<RequestId> {
        match &self.route {
            Route::Local(_) => self.core()?.order(target, method, args),
            Route::Remote(link) => link.order(target, method, args),
            Route::Detached => None,
        }
    }

    /// Call and wait up to the configured answer timeout
    pub fn answer(&self, target: &str, method: &str, args: Args) -> Option<Value> {
        self.answer_inner(target, method, args, None)
    }

    pub fn answer_with_timeout(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Duration,
    ) -> Option<Value> {
        self.answer_inner(target, method, args, Some(timeout))
    }

    fn answer_inner(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        match &self.route {
            Route::Local(_) => self.core()?.answer(target, method, args, timeout),
            Route::Remote(link) => link.answer(target, method, args, timeout),
            Route::Detached => None,
        }
    }

    /// Call without blocking; `callback` receives the result or `None`
    ///
    /// Returns whether the call was sent. The callback runs exactly once if
    /// and only if this returns `true`.
    pub fn answer_async<F>(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
        callback: F,
    ) -> bool
    where
        F: FnOnce(Option<Value>) + Send + 'static,
    {
        match &self.route {
            Route::Local(_) => match self.core() {
                Some(core) => core.answer_async(target, method, args, timeout, Box::new(callback)),
                None => false,
            },
            Route::Remote(link) => {
                Arc::clone(link).answer_async(target, method, args, timeout, Box::new(callback))
            }
            Route::Detached => false,
        }
    }

    /// High-frequency call on the poll queue, waiting up to the poll timeout
    pub fn poll(&self, target: &str, method: &str, args: Args) -> Option<Value> {
        self.poll_inner(target, method, args, None)
    }

    pub fn poll_with_timeout(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Duration,
    ) -> Option<Value> {
        self.poll_inner(target, method, args, Some(timeout))
    }

    fn poll_inner(
        &self,
        target: &str,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        match &self.route {
            Route::Local(_) => self.core()?.poll(target, method, args, timeout),
            Route::Remote(link) => link.poll(target, method, args, timeout),
            Route::Detached => None,
        }
    }

    /// One-way event; `false` when the stream queue is full or absent
    pub fn stream(&self, target: &str, func: &str, args: Args) -> bool {
        match &self.route {
            Route::Local(_) => self
                .core()
                .map(|core| core.stream(target, func, args))
                .unwrap_or(false),
            Route::Remote(link) => link.stream(target, func, args),
            Route::Detached => false,
        }
    }

    /// `order` to every registered component except this handle's own
    pub fn broadcast(&self, method: &str, args: Args) -> BTreeMap<String, RequestId> {
        let own: Vec<&str> = self.origin().into_iter().collect();
        self.broadcast_excluding(method, args, &own)
    }

    pub fn broadcast_excluding(
        &self,
        method: &str,
        args: Args,
        exclude: &[&str],
    ) -> BTreeMap<String, RequestId> {
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        match &self.route {
            Route::Local(_) => self
                .core()
                .map(|core| core.broadcast(method, args, &exclude))
                .unwrap_or_default(),
            Route::Remote(link) => link.broadcast(method, args, exclude),
            Route::Detached => BTreeMap::new(),
        }
    }

    /// The process-wide shared map
    pub fn shared(&self) -> SharedStateHandle {
        match &self.route {
            Route::Local(_) => match self.core() {
                Some(core) => SharedStateHandle::local(core.shared_state()),
                None => SharedStateHandle::detached(),
            },
            Route::Remote(link) => SharedStateHandle::remote(Arc::clone(link)),
            Route::Detached => SharedStateHandle::detached(),
        }
    }
}

impl fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let route = match self.route {
            Route::Local(_) => "local",
            Route::Remote(_) => "remote",
            Route::Detached => "detached",
        };
        f.debug_struct("BusHandle")
            .field("origin", &self.origin)
            .field("route", &route)
            .finish()
    }
}
