//! Hosted-Object Contract
//!
//! A component is a plain Rust type implementing [`Component`]. Its
//! operations are listed once in a [`MethodTable`] and looked up by name at
//! the worker boundary; a name absent from the table is reported as
//! "method missing".
//!
//! ```rust,ignore
//! struct Database { bus: BusHandle, rows: Vec<Value> }
//!
//! impl Component for Database {
//!     const CLASS: &'static str = "Database";
//!
//!     fn construct(bus: BusHandle, _args: &Args) -> Result<Self, CallError> {
//!         Ok(Self { bus, rows: Vec::new() })
//!     }
//!
//!     fn methods(table: &mut MethodTable<Self>) {
//!         table.add("ping", |_, _| Ok(Value::from("pong")));
//!     }
//! }
//! ```
//!
//! The [`BusHandle`] passed to `construct` is how an instance originates
//! traffic; the bus never touches the instance's fields.

use crate::error::BusError;
use crate::handle::BusHandle;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use types::{Args, Value, ValueError};

/// Failure of a hosted operation, reported back as an error result
#[derive(Debug, Error)]
pub enum CallError {
    #[error("method missing: {0}")]
    MissingMethod(String),

    #[error("bad argument: {0}")]
    Argument(#[from] ValueError),

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl CallError {
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

pub type Handler<C> = fn(&mut C, &Args) -> Result<Value, CallError>;

/// Name → handler dispatch table of one component type
pub struct MethodTable<C> {
    handlers: HashMap<&'static str, Handler<C>>,
}

impl<C> Default for MethodTable<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C> MethodTable<C> {
    pub fn add(&mut self, name: &'static str, handler: Handler<C>) -> &mut Self {
        self.handlers.insert(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Handler<C>> {
        self.handlers.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A type that can be hosted on the bus
pub trait Component: Send + Sized + 'static {
    /// Class name used to rebuild the instance inside a worker process
    const CLASS: &'static str;

    fn construct(bus: BusHandle, args: &Args) -> Result<Self, CallError>;

    fn methods(table: &mut MethodTable<Self>);

    /// Called once inside a process worker before its loops start
    fn initialize(&mut self) -> Result<(), CallError> {
        Ok(())
    }

    /// Called once when the control loop receives its stop envelope
    fn cleanup(&mut self) {}
}

/// Type-erased hosted instance driven by the worker loops
pub trait HostedObject: Send {
    fn class(&self) -> &'static str;

    fn invoke(&mut self, method: &str, args: &Args) -> Result<Value, CallError>;

    fn has_method(&self, method: &str) -> bool;

    fn initialize(&mut self) -> Result<(), CallError>;

    fn cleanup(&mut self);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Hosted<C: Component> {
    instance: C,
    methods: MethodTable<C>,
}

impl<C: Component> HostedObject for Hosted<C> {
    fn class(&self) -> &'static str {
        C::CLASS
    }

    fn invoke(&mut self, method: &str, args: &Args) -> Result<Value, CallError> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| CallError::MissingMethod(method.to_string()))?;
        handler(&mut self.instance, args)
    }

    fn has_method(&self, method: &str) -> bool {
        self.methods.get(method).is_some()
    }

    fn initialize(&mut self) -> Result<(), CallError> {
        self.instance.initialize()
    }

    fn cleanup(&mut self) {
        self.instance.cleanup()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        &mut self.instance
    }
}

/// Build a hosted instance of `C`
pub fn host<C: Component>(bus: BusHandle, args: &Args) -> Result<Box<dyn HostedObject>, CallError> {
    let instance = C::construct(bus, args)?;
    let mut methods = MethodTable::default();
    C::methods(&mut methods);
    Ok(Box::new(Hosted { instance, methods }))
}

pub type Constructor = fn(BusHandle, &Args) -> Result<Box<dyn HostedObject>, CallError>;

/// Class name → constructor
///
/// The worker program of a process component holds a catalog with the same
/// classes as the parent so it can rebuild the instance from class name and
/// stored args.
#[derive(Clone, Default)]
pub struct Catalog {
    classes: HashMap<&'static str, Constructor>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<C: Component>(&mut self) -> &mut Self {
        self.classes.insert(C::CLASS, host::<C>);
        self
    }

    pub fn with<C: Component>(mut self) -> Self {
        self.add::<C>();
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    pub fn classes(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.classes.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn construct(
        &self,
        name: &str,
        class: &str,
        bus: BusHandle,
        args: &Args,
    ) -> Result<Box<dyn HostedObject>, BusError> {
        let constructor = self.classes.get(class).ok_or_else(|| BusError::UnknownClass {
            class: class.to_string(),
        })?;
        constructor(bus, args).map_err(|e| BusError::construct(name, e))
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("classes", &self.classes())
            .finish()
    }
}
