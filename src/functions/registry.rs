//! Engine registry and the live functions context
//!
//! A single non-reentrant lock guards both the engine table and the live
//! [`FunctionsContext`]. Every FUNCTION / FCALL operation runs to completion
//! while holding it, engine calls included.

use std::mem;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::FunctionsConfig;
use crate::error::{FunctionsError, Result};

use super::context::FunctionsContext;
use super::dirty::{DirtyCounter, WriteTracker};
use super::engine::{Engine, ExecutionClient};
use super::library::{Library, LibraryBuilder};

/// A registered engine with its execution client.
pub(crate) struct EngineDescriptor {
    pub(crate) name: String,
    pub(crate) engine: Box<dyn Engine>,
    pub(crate) client: ExecutionClient,
    /// Libraries of this engine held by contexts that are no longer live
    pub(crate) displaced: usize,
}

/// Everything behind the registry lock.
pub(crate) struct RegistryState {
    pub(crate) engines: Vec<EngineDescriptor>,
    pub(crate) current: FunctionsContext,
    next_client_id: u64,
}

/// Memory usage of the functions subsystem, as reported by INFO memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionsMemoryInfo {
    /// Memory reported by the engines' runtimes
    pub engines_memory: usize,
    /// Library/function estimate plus engine overheads
    pub functions_caches: usize,
    /// Loaded libraries
    pub library_count: usize,
    /// Loaded functions
    pub function_count: usize,
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<RegistryState>,
    pub(crate) tracker: Arc<dyn WriteTracker>,
    pub(crate) config: FunctionsConfig,
    /// Background disposals started by FLUSH ASYNC
    pub(crate) lazyfree: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle to the functions subsystem.
///
/// Cloning is cheap; all clones see the same engines and libraries.
#[derive(Clone)]
pub struct FunctionsRegistry {
    pub(crate) inner: Arc<Inner>,
}

impl FunctionsRegistry {
    /// Create a registry with default settings and no engines
    pub fn new() -> Self {
        Self::with_config(FunctionsConfig::default(), Arc::new(DirtyCounter::new()))
    }

    /// Create a registry with the given settings and write tracker
    pub fn with_config(config: FunctionsConfig, tracker: Arc<dyn WriteTracker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState {
                    engines: Vec::new(),
                    current: FunctionsContext::default(),
                    next_client_id: 1,
                }),
                tracker,
                config,
                lazyfree: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a registry with the engines enabled in `config` registered
    pub fn with_builtin_engines(
        config: FunctionsConfig,
        tracker: Arc<dyn WriteTracker>,
    ) -> Result<Self> {
        let registry = Self::with_config(config, tracker);
        #[cfg(feature = "lua")]
        if registry.inner.config.lua_enabled {
            registry.register_engine("LUA", Box::new(super::lua::LuaEngine::new()?))?;
        }
        Ok(registry)
    }

    /// Settings the registry was created with
    pub fn config(&self) -> &FunctionsConfig {
        &self.inner.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock()
    }

    pub(crate) fn mark_dirty(&self) {
        self.inner.tracker.mark_dirty();
    }

    /// Register an engine under a case-insensitive unique name
    pub fn register_engine(&self, name: &str, engine: Box<dyn Engine>) -> Result<()> {
        let mut state = self.lock();
        if state.engine_index(name).is_some() {
            return Err(FunctionsError::EngineAlreadyRegistered(name.to_string()));
        }

        let client = ExecutionClient::new(state.next_client_id, name);
        state.next_client_id += 1;
        state.current.add_engine(name);
        state.engines.push(EngineDescriptor {
            name: name.to_string(),
            engine,
            client,
            displaced: 0,
        });

        info!(engine = name, "Function engine registered");
        Ok(())
    }

    /// Remove an engine that no longer owns any library
    pub fn unregister_engine(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let idx = state
            .engine_index(name)
            .ok_or_else(|| FunctionsError::EngineNotFound(name.to_string()))?;

        let canonical = state.engines[idx].name.clone();
        let live = state.current.engine_stats(&canonical).library_count;
        if live > 0 || state.engines[idx].displaced > 0 {
            return Err(FunctionsError::EngineInUse(canonical));
        }

        let descriptor = state.engines.remove(idx);
        state.current.remove_engine(&canonical);
        drop(state);

        descriptor.engine.release();
        info!(engine = %canonical, "Function engine unregistered");
        Ok(())
    }

    /// Whether an engine is registered under `name` (case-insensitive)
    pub fn has_engine(&self, name: &str) -> bool {
        self.lock().engine_index(name).is_some()
    }

    /// Registered engine names in registration order
    pub fn engine_names(&self) -> Vec<String> {
        self.lock().engines.iter().map(|d| d.name.clone()).collect()
    }

    /// Number of loaded libraries
    pub fn library_count(&self) -> usize {
        self.lock().current.library_count()
    }

    /// Number of loaded functions
    pub fn function_count(&self) -> usize {
        self.lock().current.function_count()
    }

    /// Estimated bytes held by libraries and functions
    pub fn total_memory(&self) -> usize {
        self.lock().current.total_memory()
    }

    /// Memory figures for INFO memory
    pub fn memory_info(&self) -> FunctionsMemoryInfo {
        let state = self.lock();
        let engines_memory = state.engines.iter().map(|d| d.engine.used_memory()).sum();
        let engine_overhead: usize = state
            .engines
            .iter()
            .map(|d| d.engine.engine_overhead())
            .sum();

        FunctionsMemoryInfo {
            engines_memory,
            functions_caches: state.current.total_memory() + engine_overhead,
            library_count: state.current.library_count(),
            function_count: state.current.function_count(),
        }
    }

    /// Run `f` against the live context under the registry lock
    pub fn inspect<R>(&self, f: impl FnOnce(&FunctionsContext) -> R) -> R {
        f(&self.lock().current)
    }

    /// Check the index and statistics invariants of the live context
    pub fn is_consistent(&self) -> bool {
        self.inspect(FunctionsContext::is_consistent)
    }

    /// Create an empty context with zeroed statistics for every engine
    pub fn create_context(&self) -> FunctionsContext {
        let state = self.lock();
        FunctionsContext::new(state.engines.iter().map(|d| d.name.as_str()))
    }

    /// Install `new` as the live context and return the displaced one.
    ///
    /// Engines owning libraries in the returned context cannot be
    /// unregistered until it is passed to [`FunctionsRegistry::dispose`].
    pub fn swap_current(&self, new: FunctionsContext) -> FunctionsContext {
        self.lock().displace(new)
    }

    /// Release every handle of a context that is no longer live
    pub fn dispose(&self, mut ctx: FunctionsContext) {
        let libraries = ctx.clear();
        if libraries.is_empty() {
            return;
        }

        let count = libraries.len();
        let mut state = self.lock();
        for library in libraries {
            if let Some(idx) = state.engine_index(library.engine()) {
                let descriptor = &mut state.engines[idx];
                descriptor.displaced = descriptor.displaced.saturating_sub(1);
            }
            state.release_library(library);
        }
        debug!(libraries = count, "Disposed functions context");
    }

    pub(crate) fn track_lazyfree(&self, handle: JoinHandle<()>) {
        let mut pending = self.inner.lazyfree.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Block until every background disposal has finished
    fn drain_lazyfree(&self) {
        let pending = mem::take(&mut *self.inner.lazyfree.lock());
        for handle in pending {
            if handle.join().is_err() {
                warn!("Lazyfree thread panicked");
            }
        }
    }

    /// Release all libraries and then all engines.
    ///
    /// Waits for pending FLUSH ASYNC disposals first so every handle goes
    /// back to the engine that produced it.
    pub fn shutdown(&self) {
        self.drain_lazyfree();

        let mut state = self.lock();
        for library in state.current.clear() {
            state.release_library(library);
        }

        let engines = mem::take(&mut state.engines);
        for descriptor in &engines {
            if descriptor.displaced > 0 {
                warn!(
                    engine = %descriptor.name,
                    libraries = descriptor.displaced,
                    "Releasing engine with undisposed libraries"
                );
            }
            state.current.remove_engine(&descriptor.name);
        }
        drop(state);

        for descriptor in engines {
            debug!(engine = %descriptor.name, "Releasing function engine");
            descriptor.engine.release();
        }
        info!("Functions subsystem shut down");
    }
}

impl Default for FunctionsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryState {
    /// Position of the engine registered as `name`, ignoring case
    pub(crate) fn engine_index(&self, name: &str) -> Option<usize> {
        self.engines
            .iter()
            .position(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Swap in `new` as the live context, moving the per-engine accounting
    /// of displaced libraries along with it
    pub(crate) fn displace(&mut self, new: FunctionsContext) -> FunctionsContext {
        for descriptor in &mut self.engines {
            let returning = new.engine_stats(&descriptor.name).library_count;
            let leaving = self.current.engine_stats(&descriptor.name).library_count;
            descriptor.displaced = descriptor.displaced.saturating_sub(returning) + leaving;
        }
        mem::replace(&mut self.current, new)
    }

    /// Give a removed library's handles back to its engine
    pub(crate) fn release_library(&mut self, library: Library) {
        match self.engine_index(library.engine()) {
            Some(idx) => {
                let engine = &mut self.engines[idx].engine;
                for handle in library.into_handles() {
                    engine.release_function(handle);
                }
            }
            None => warn!(
                library = library.name(),
                engine = library.engine(),
                "Dropping library of unknown engine"
            ),
        }
    }

    /// Compile and install a library into the live context.
    ///
    /// Nothing in the live context changes unless every step succeeds.
    pub(crate) fn install(
        &mut self,
        engine_name: &str,
        library_name: &str,
        code: &str,
        body: &str,
        replace: bool,
        timeout: Duration,
    ) -> Result<()> {
        let idx = self
            .engine_index(engine_name)
            .ok_or_else(|| FunctionsError::EngineNotFound(engine_name.to_string()))?;

        if !replace && self.current.library(library_name).is_some() {
            return Err(FunctionsError::LibraryExists(library_name.to_string()));
        }

        let descriptor = &mut self.engines[idx];
        let mut builder = LibraryBuilder::new(library_name, &descriptor.name, code);
        if let Err(e) = descriptor.engine.compile(&mut builder, body, timeout) {
            for handle in builder.into_handles() {
                descriptor.engine.release_function(handle);
            }
            return Err(e);
        }

        let (library, rejected) = builder.finish();
        for handle in rejected {
            descriptor.engine.release_function(handle);
        }

        let conflict = if library.function_count() == 0 {
            Some(FunctionsError::CompileError(
                "No functions registered".to_string(),
            ))
        } else {
            library
                .function_names()
                .find(|f| {
                    self.current
                        .owner_of(f)
                        .is_some_and(|owner| owner != library_name)
                })
                .map(|f| FunctionsError::FunctionExists(f.to_string()))
        };
        if let Some(e) = conflict {
            for handle in library.into_handles() {
                descriptor.engine.release_function(handle);
            }
            return Err(e);
        }

        let overhead = library
            .functions()
            .map(|f| descriptor.engine.function_overhead(f.handle()))
            .sum();

        if let Some(old) = self.current.remove(library_name) {
            self.release_library(old);
        }
        self.current.insert(library, overhead);
        Ok(())
    }
}
