//! Server-side functions
//!
//! Clients upload libraries of code through `FUNCTION LOAD` and invoke the
//! functions those libraries register with `FCALL` / `FCALL_RO`. The
//! [`FunctionsRegistry`] owns the registered [`Engine`]s and the live
//! [`FunctionsContext`]; everything goes through its single lock.
//!
//! # Example
//!
//! ```ignore
//! use ferrite_functions::functions::{CallMode, FunctionsRegistry};
//!
//! let registry = FunctionsRegistry::new();
//! registry.register_engine("LUA", Box::new(LuaEngine::new()?))?;
//! registry.load("#!lua name=lib\nredis.register_function('f', function() return 1 end)", false)?;
//! let reply = registry.call("f", 0, &[], CallMode::Write)?;
//! ```

mod context;
mod dirty;
pub mod dump;
mod engine;
mod invoke;
mod library;
mod lifecycle;
#[cfg(feature = "lua")]
mod lua;
pub mod metadata;
mod registry;

pub use context::{EngineStats, FunctionsContext};
pub use dirty::{DirtyCounter, WriteTracker};
pub use engine::{CompiledFunction, Engine, ExecutionClient, InvocationContext};
pub use invoke::{split_keys, CallMode};
pub use library::{verify_name, FunctionEntry, FunctionFlags, Library, LibraryBuilder};
pub use lifecycle::{FlushMode, FunctionInfo, LibraryInfo, RestorePolicy};
#[cfg(feature = "lua")]
pub use lua::LuaEngine;
pub use registry::{FunctionsMemoryInfo, FunctionsRegistry};
