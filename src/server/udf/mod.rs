//! Server-side functions that callers invoke by name.
//!
//! A caller names a function and hands over a parameter blob scoped to one
//! partition; the server looks the name up in a [`FunctionRegistry`],
//! constructs a fresh instance, and runs it against that partition. Only
//! names registered at startup resolve, so the registry doubles as the
//! allow-list of code callers may run. Registered functions run in-process
//! with full access to the store; nothing sandboxes them.

pub mod builtin;

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use hashbrown::HashMap;
use tracing::{debug, warn};

use super::partition::{PartitionKey, PartitionStore, StoreError};

/// The partition a function runs against and its encoded arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionParam {
    pub key: PartitionKey,
    pub bytes: Vec<u8>,
}

/// A read-only function. Its result is handed back to the caller verbatim.
pub trait GetFunc: Send {
    fn partition_get(
        &self,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<Vec<u8>, FuncError>;
}

/// A function that mutates one partition. Returning `Ok` means it completed.
pub trait UpdateFunc: Send {
    fn partition_update(
        &self,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<(), FuncError>;
}

type GetFactory = Arc<dyn Fn() -> Result<Box<dyn GetFunc>, FuncError> + Send + Sync>;
type UpdateFactory =
    Arc<dyn Fn() -> Result<Box<dyn UpdateFunc>, FuncError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum FuncError {
    /// No function is registered under this name.
    Unresolved(String),
    Construct { name: String, reason: String },
    InvalidParam(String),
    Store(StoreError),
    Failed(String),
    Panicked { name: String, message: String },
}

impl From<StoreError> for FuncError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl fmt::Display for FuncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved(name) => write!(f, "no function registered as {name:?}"),
            Self::Construct { name, reason } => {
                write!(f, "could not construct {name}: {reason}")
            }
            Self::InvalidParam(reason) => write!(f, "invalid parameter: {reason}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Failed(reason) => f.write_str(reason),
            Self::Panicked { name, message } => write!(f, "{name} panicked: {message}"),
        }
    }
}

impl std::error::Error for FuncError {}

/// Maps function names to factories.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    get_funcs: HashMap<String, GetFactory>,
    update_funcs: HashMap<String, UpdateFactory>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the functions in [`builtin`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Registers a get function built with `F::default()` for every call.
    pub fn register_get<F>(&mut self, name: impl Into<String>)
    where
        F: GetFunc + Default + 'static,
    {
        self.register_get_factory(name, || Ok(Box::new(F::default()) as Box<dyn GetFunc>));
    }

    pub fn register_get_factory<C>(&mut self, name: impl Into<String>, factory: C)
    where
        C: Fn() -> Result<Box<dyn GetFunc>, FuncError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(%name, "registering get function");
        self.get_funcs.insert(name, Arc::new(factory));
    }

    /// Registers an update function built with `F::default()` for every call.
    pub fn register_update<F>(&mut self, name: impl Into<String>)
    where
        F: UpdateFunc + Default + 'static,
    {
        self.register_update_factory(name, || {
            Ok(Box::new(F::default()) as Box<dyn UpdateFunc>)
        });
    }

    pub fn register_update_factory<C>(&mut self, name: impl Into<String>, factory: C)
    where
        C: Fn() -> Result<Box<dyn UpdateFunc>, FuncError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(%name, "registering update function");
        self.update_funcs.insert(name, Arc::new(factory));
    }

    /// Drops every registered function whose name is not in `allowed`.
    pub fn retain_allowed(&mut self, allowed: &[String]) {
        let keep = |name: &String| {
            let keep = allowed.contains(name);
            if !keep {
                warn!(%name, "function is not on the allow-list, unregistering");
            }
            keep
        };
        self.get_funcs.retain(|name, _| keep(name));
        self.update_funcs.retain(|name, _| keep(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_funcs.contains_key(name) || self.update_funcs.contains_key(name)
    }

    /// Every registered name, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .get_funcs
            .keys()
            .chain(self.update_funcs.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }

    /// Resolves `name` to a get function, builds it and runs it. Panics
    /// inside the function are caught and reported as
    /// [`FuncError::Panicked`].
    pub fn invoke_get(
        &self,
        name: &str,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<Vec<u8>, FuncError> {
        let factory = self
            .get_funcs
            .get(name)
            .ok_or_else(|| FuncError::Unresolved(name.to_string()))?;
        guarded(name, || {
            let func = construct(name, &**factory)?;
            func.partition_get(store, param)
        })
    }

    /// Resolves `name` to an update function, builds it and runs it.
    pub fn invoke_update(
        &self,
        name: &str,
        store: &dyn PartitionStore,
        param: &PartitionParam,
    ) -> Result<(), FuncError> {
        let factory = self
            .update_funcs
            .get(name)
            .ok_or_else(|| FuncError::Unresolved(name.to_string()))?;
        guarded(name, || {
            let func = construct(name, &**factory)?;
            func.partition_update(store, param)
        })
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

fn construct<T: ?Sized>(
    name: &str,
    factory: &(dyn Fn() -> Result<Box<T>, FuncError> + Send + Sync),
) -> Result<Box<T>, FuncError> {
    factory().map_err(|e| FuncError::Construct {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn guarded<T>(
    name: &str,
    f: impl FnOnce() -> Result<T, FuncError>,
) -> Result<T, FuncError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        Err(FuncError::Panicked {
            name: name.to_string(),
            message: panic_message(panic.as_ref()),
        })
    })
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
