//! The live set of libraries
//!
//! A [`FunctionsContext`] owns every loaded library, a flat index from
//! function name to owning library, per-engine counters and a memory
//! estimate. It performs no validation of its own: callers check names and
//! collisions before [`FunctionsContext::insert`].

use std::collections::{BTreeMap, HashMap};

use crate::error::{FunctionsError, Result};

use super::library::{FunctionEntry, Library};

/// Per-engine library and function counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Libraries owned by the engine
    pub library_count: usize,
    /// Functions across those libraries
    pub function_count: usize,
}

#[derive(Debug)]
struct Slot {
    library: Library,
    size: usize,
}

/// Container of loaded libraries.
#[derive(Debug, Default)]
pub struct FunctionsContext {
    libraries: BTreeMap<String, Slot>,
    functions: HashMap<String, String>,
    engine_stats: HashMap<String, EngineStats>,
    memory: usize,
}

impl FunctionsContext {
    /// Create an empty context with zeroed statistics for each engine
    pub fn new<'a>(engines: impl IntoIterator<Item = &'a str>) -> Self {
        let engine_stats = engines
            .into_iter()
            .map(|name| (name.to_string(), EngineStats::default()))
            .collect();
        Self {
            engine_stats,
            ..Self::default()
        }
    }

    /// Number of loaded libraries
    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    /// Number of functions in the flat index
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Estimated bytes held by libraries and functions
    pub fn total_memory(&self) -> usize {
        self.memory
    }

    /// Look up a library by exact name
    pub fn library(&self, name: &str) -> Option<&Library> {
        self.libraries.get(name).map(|slot| &slot.library)
    }

    /// Loaded libraries, sorted by name
    pub fn libraries(&self) -> impl Iterator<Item = &Library> {
        self.libraries.values().map(|slot| &slot.library)
    }

    /// Name of the library that owns `function`
    pub fn owner_of(&self, function: &str) -> Option<&str> {
        self.functions.get(function).map(String::as_str)
    }

    /// Counters for one engine (zero if the engine owns nothing)
    pub fn engine_stats(&self, engine: &str) -> EngineStats {
        self.engine_stats.get(engine).copied().unwrap_or_default()
    }

    /// Resolve a function through the flat index.
    ///
    /// An index entry pointing at a missing library or function means the
    /// context is corrupt and yields `InvalidFunctionReference`.
    pub fn resolve(&self, function: &str) -> Result<&FunctionEntry> {
        let owner = self
            .functions
            .get(function)
            .ok_or_else(|| FunctionsError::FunctionNotFound(function.to_string()))?;
        self.library(owner)
            .and_then(|library| library.function(function))
            .ok_or_else(|| FunctionsError::InvalidFunctionReference(function.to_string()))
    }

    pub(crate) fn add_engine(&mut self, engine: &str) {
        self.engine_stats.entry(engine.to_string()).or_default();
    }

    pub(crate) fn remove_engine(&mut self, engine: &str) {
        self.engine_stats.remove(engine);
    }

    /// Install a library whose names were already checked against this context.
    ///
    /// `overhead` is the engine-reported size of the library's handles.
    pub(crate) fn insert(&mut self, library: Library, overhead: usize) {
        let size = library.malloc_size()
            + library.functions().map(FunctionEntry::malloc_size).sum::<usize>()
            + overhead;

        for function in library.function_names() {
            self.functions
                .insert(function.to_string(), library.name().to_string());
        }

        let stats = self
            .engine_stats
            .entry(library.engine().to_string())
            .or_default();
        stats.library_count += 1;
        stats.function_count += library.function_count();

        self.memory += size;
        self.libraries
            .insert(library.name().to_string(), Slot { library, size });
    }

    /// Remove a library together with its index entries and counters
    pub(crate) fn remove(&mut self, name: &str) -> Option<Library> {
        let Slot { library, size } = self.libraries.remove(name)?;

        for function in library.function_names() {
            self.functions.remove(function);
        }

        if let Some(stats) = self.engine_stats.get_mut(library.engine()) {
            stats.library_count = stats.library_count.saturating_sub(1);
            stats.function_count = stats
                .function_count
                .saturating_sub(library.function_count());
        }

        self.memory = self.memory.saturating_sub(size);
        Some(library)
    }

    /// Empty the context in place, returning the removed libraries
    pub(crate) fn clear(&mut self) -> Vec<Library> {
        self.functions.clear();
        self.memory = 0;
        for stats in self.engine_stats.values_mut() {
            *stats = EngineStats::default();
        }
        std::mem::take(&mut self.libraries)
            .into_values()
            .map(|slot| slot.library)
            .collect()
    }

    /// Check that the flat index and per-engine counters agree with the
    /// libraries actually loaded.
    pub fn is_consistent(&self) -> bool {
        let indexed: usize = self.libraries().map(Library::function_count).sum();
        if indexed != self.functions.len() {
            return false;
        }

        let index_ok = self.libraries().all(|library| {
            library
                .function_names()
                .all(|f| self.owner_of(f) == Some(library.name()))
        });
        if !index_ok {
            return false;
        }

        let mut expected: HashMap<&str, EngineStats> = HashMap::new();
        for library in self.libraries() {
            let stats = expected.entry(library.engine()).or_default();
            stats.library_count += 1;
            stats.function_count += library.function_count();
        }
        let stats_ok = self.engine_stats.iter().all(|(engine, stats)| {
            expected.get(engine.as_str()).copied().unwrap_or_default() == *stats
        });

        stats_ok
            && expected
                .keys()
                .all(|engine| self.engine_stats.contains_key(*engine))
    }
}
