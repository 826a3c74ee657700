//! Function registry for name-addressed remote execution
//!
//! Payloads name their target function and initializer instead of carrying
//! code. The worker side resolves those names here and runs them against
//! JSON arguments.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{CallError, CallErrorKind};
use crate::dispatch::CallPayload;

/// Worker-global state seeded by an initializer
///
/// A fresh instance is created for every invocation, so state set by the
/// initializer is only visible to the call it runs in front of.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Globals {
    values: HashMap<String, Value>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a global
    pub fn set<T: Serialize>(&mut self, name: impl Into<String>, value: T) -> Result<(), CallError> {
        self.values.insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read a global
    ///
    /// Fails like an undefined name would if the initializer never set it.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, CallError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| CallError::function(format!("global '{name}' is not defined")))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Type-erased target function
type FunctionHandler = Box<dyn Fn(&Globals, Value) -> Result<Value, CallError> + Send + Sync>;

/// Type-erased initializer
type InitializerHandler = Box<dyn Fn(&mut Globals, Value) -> Result<(), CallError> + Send + Sync>;

/// Typed handle to a registered function
///
/// Carries the argument and result types so callers get typed results back
/// without repeating them at every call site.
pub struct FunctionRef<A, R> {
    name: String,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> FunctionRef<A, R> {
    /// Reference a function by name, e.g. one registered only on remote workers
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<A, R> Clone for FunctionRef<A, R> {
    fn clone(&self) -> Self {
        Self::named(self.name.clone())
    }
}

impl<A, R> fmt::Debug for FunctionRef<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FunctionRef").field(&self.name).finish()
    }
}

/// Typed handle to a registered initializer
pub struct InitializerRef<A> {
    name: String,
    _types: PhantomData<fn(A)>,
}

impl<A> InitializerRef<A> {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<A> Clone for InitializerRef<A> {
    fn clone(&self) -> Self {
        Self::named(self.name.clone())
    }
}

impl<A> fmt::Debug for InitializerRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InitializerRef").field(&self.name).finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Name already taken
    #[error("'{0}' is already registered")]
    Duplicate(String),
}

/// Registry of callable functions and initializers
///
/// # Example
///
/// ```
/// use nimbus_core::{FunctionRegistry, Globals, CallError};
///
/// let mut registry = FunctionRegistry::new();
/// let init = registry
///     .register_initializer("seed", |globals: &mut Globals, (a, b): (String, i64)| {
///         globals.set("param1", a)?;
///         globals.set("param2", b)
///     })
///     .unwrap();
/// let work = registry
///     .register_function("work", |globals: &Globals, _n: i64| -> Result<(String, i64), CallError> {
///         Ok((globals.get("param1")?, globals.get("param2")?))
///     })
///     .unwrap();
/// assert_eq!(init.name(), "seed");
/// assert_eq!(work.name(), "work");
/// ```
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionHandler>,
    initializers: HashMap<String, InitializerHandler>,
}

impl FunctionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target function
    pub fn register_function<A, R, E, F>(
        &mut self,
        name: &str,
        function: F,
    ) -> Result<FunctionRef<A, R>, RegistryError>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        E: Into<CallError>,
        F: Fn(&Globals, A) -> Result<R, E> + Send + Sync + 'static,
    {
        if self.functions.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }

        let handler: FunctionHandler = Box::new(
            move |globals: &Globals, args: Value| -> Result<Value, CallError> {
                let typed_args: A = serde_json::from_value(args)?;
                match function(globals, typed_args) {
                    Ok(result) => Ok(serde_json::to_value(result)?),
                    Err(err) => Err(err.into()),
                }
            },
        );

        self.functions.insert(name.to_string(), handler);
        Ok(FunctionRef::named(name))
    }

    /// Register an initializer
    pub fn register_initializer<A, E, F>(
        &mut self,
        name: &str,
        initializer: F,
    ) -> Result<InitializerRef<A>, RegistryError>
    where
        A: DeserializeOwned + 'static,
        E: Into<CallError>,
        F: Fn(&mut Globals, A) -> Result<(), E> + Send + Sync + 'static,
    {
        if self.initializers.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }

        let handler: InitializerHandler = Box::new(
            move |globals: &mut Globals, args: Value| -> Result<(), CallError> {
                let typed_args: A = serde_json::from_value(args)?;
                initializer(globals, typed_args).map_err(Into::into)
            },
        );

        self.initializers.insert(name.to_string(), handler);
        Ok(InitializerRef::named(name))
    }

    /// Check if a function is registered
    pub fn contains_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Check if an initializer is registered
    pub fn contains_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    /// Get the number of registered functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Run one invocation
    ///
    /// Builds fresh globals, re-runs the payload's initializer (if any) and
    /// then calls the target function. This is the whole remote-side
    /// contract: nothing survives between invocations.
    pub fn execute(&self, payload: &CallPayload) -> Result<Value, CallError> {
        let function = self.functions.get(&payload.function).ok_or_else(|| {
            CallError::new(
                CallErrorKind::UnknownFunction,
                format!("function '{}' is not registered", payload.function),
            )
        })?;

        let mut globals = Globals::new();
        if let Some(context) = &payload.initializer {
            let initializer = self.initializers.get(&context.initializer).ok_or_else(|| {
                CallError::new(
                    CallErrorKind::UnknownFunction,
                    format!("initializer '{}' is not registered", context.initializer),
                )
            })?;

            debug!(
                executor_id = %payload.executor_id,
                call_id = %payload.call_id,
                initializer = %context.initializer,
                "Running initializer"
            );
            initializer(&mut globals, context.initargs.clone())
                .map_err(CallError::in_initializer)?;
        }

        function(&globals, payload.args.clone())
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("initializers", &self.initializers.keys().collect::<Vec<_>>())
            .finish()
    }
}
