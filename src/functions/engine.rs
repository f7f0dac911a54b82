//! Engine contract
//!
//! An engine turns library source into compiled function handles and runs
//! them on request. Engines are registered by name with the
//! [`FunctionsRegistry`](super::FunctionsRegistry) and are only ever called
//! while the registry lock is held.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::Frame;

use super::library::LibraryBuilder;

/// Opaque compiled function handle owned by an engine.
///
/// Handles are released only through the owning engine's
/// [`Engine::release_function`].
pub enum CompiledFunction {
    /// Callback pinned in a Lua interpreter registry
    #[cfg(feature = "lua")]
    Lua(mlua::RegistryKey),
    /// Handle of an out-of-tree engine
    Custom(Box<dyn Any + Send>),
}

impl CompiledFunction {
    /// Wrap an engine-specific value as a handle
    pub fn custom<T: Any + Send>(value: T) -> Self {
        CompiledFunction::Custom(Box::new(value))
    }

    /// Borrow the value of a `Custom` handle if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            CompiledFunction::Custom(value) => value.downcast_ref::<T>(),
            #[cfg(feature = "lua")]
            CompiledFunction::Lua(_) => None,
        }
    }

    /// Take back the value of a `Custom` handle if it has type `T`
    pub fn into_custom<T: Any>(self) -> std::result::Result<Box<T>, Self> {
        match self {
            CompiledFunction::Custom(value) => {
                value.downcast::<T>().map_err(CompiledFunction::Custom)
            }
            #[cfg(feature = "lua")]
            other => Err(other),
        }
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "lua")]
            CompiledFunction::Lua(_) => f.write_str("CompiledFunction::Lua"),
            CompiledFunction::Custom(_) => f.write_str("CompiledFunction::Custom"),
        }
    }
}

/// Dedicated client identity each engine executes on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionClient {
    id: u64,
    engine: String,
}

impl ExecutionClient {
    pub(crate) fn new(id: u64, engine: &str) -> Self {
        Self {
            id,
            engine: engine.to_string(),
        }
    }

    /// Unique client id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the engine this client belongs to
    pub fn engine(&self) -> &str {
        &self.engine
    }
}

/// Per-call information handed to [`Engine::invoke`].
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    /// Client the engine runs the call through
    pub client: &'a ExecutionClient,
    /// Name of the function being invoked
    pub function: &'a str,
    /// True for FCALL_RO; the function was verified to carry `no-writes`
    pub read_only: bool,
}

/// A pluggable function execution engine.
pub trait Engine: Send {
    /// Compile `code` and register its functions into `library`.
    ///
    /// `code` is the library source with the metadata header line blanked
    /// out, so line numbers match what the client submitted. The engine
    /// should abort compilation once `timeout` has elapsed.
    fn compile(&mut self, library: &mut LibraryBuilder, code: &str, timeout: Duration)
        -> Result<()>;

    /// Run a compiled function with the given keys and arguments.
    fn invoke(
        &mut self,
        ctx: &InvocationContext<'_>,
        function: &CompiledFunction,
        keys: &[Bytes],
        args: &[Bytes],
    ) -> Result<Frame>;

    /// Memory used by the engine's runtime
    fn used_memory(&self) -> usize;

    /// Memory attributable to one compiled handle
    fn function_overhead(&self, function: &CompiledFunction) -> usize;

    /// Fixed memory overhead of the engine itself
    fn engine_overhead(&self) -> usize;

    /// Release a handle previously produced by `compile`
    fn release_function(&mut self, function: CompiledFunction);

    /// Tear down the engine. Called once, after all its handles were released.
    fn release(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_handle_downcast() {
        let handle = CompiledFunction::custom(42u32);
        assert_eq!(handle.downcast_ref::<u32>(), Some(&42));
        assert!(handle.downcast_ref::<String>().is_none());

        let handle = match handle.into_custom::<String>() {
            Ok(_) => panic!("wrong type must not downcast"),
            Err(handle) => handle,
        };
        assert_eq!(*handle.into_custom::<u32>().unwrap(), 42);
    }

    #[test]
    fn test_execution_client() {
        let client = ExecutionClient::new(7, "LUA");
        assert_eq!(client.id(), 7);
        assert_eq!(client.engine(), "LUA");
    }
}
