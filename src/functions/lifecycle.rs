//! Library lifecycle: LOAD, LIST, STATS, DELETE, FLUSH, DUMP, RESTORE, KILL

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{FunctionsError, Result};

use super::context::{EngineStats, FunctionsContext};
use super::dump::{self, DumpWriter};
use super::library::FunctionFlags;
use super::metadata;
use super::registry::FunctionsRegistry;

/// How FUNCTION FLUSH frees the old libraries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Release inline before replying
    Sync,
    /// Swap in an empty context and release the old one in the background
    Async,
}

/// How FUNCTION RESTORE treats libraries that already exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorePolicy {
    /// Keep existing libraries, skip same-named records
    #[default]
    Append,
    /// Overwrite same-named libraries
    Replace,
    /// Delete everything before restoring
    Flush,
}

/// One function in a FUNCTION LIST entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Function name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Declared flags
    pub flags: FunctionFlags,
}

/// One library in a FUNCTION LIST reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInfo {
    /// Library name
    pub name: String,
    /// Engine name
    pub engine: String,
    /// Functions, sorted by name
    pub functions: Vec<FunctionInfo>,
    /// Source, present only when requested
    pub code: Option<String>,
}

impl FunctionsRegistry {
    /// FUNCTION LOAD with the configured timeout. Returns the library name.
    pub fn load(&self, code: &str, replace: bool) -> Result<String> {
        self.load_with_timeout(code, replace, self.config().load_timeout())
    }

    /// FUNCTION LOAD with an explicit compile timeout
    pub fn load_with_timeout(
        &self,
        code: &str,
        replace: bool,
        timeout: Duration,
    ) -> Result<String> {
        let meta = metadata::parse(code)?;

        let mut state = self.lock();
        state.install(meta.engine, meta.name, code, meta.body, replace, timeout)?;
        let functions = state
            .current
            .library(meta.name)
            .map_or(0, |library| library.function_count());
        drop(state);

        self.mark_dirty();
        info!(
            library = meta.name,
            engine = meta.engine,
            functions,
            replace,
            "Library loaded"
        );
        Ok(meta.name.to_string())
    }

    /// FUNCTION LIST, optionally filtered by a library-name substring
    pub fn list(&self, library_pattern: Option<&str>, with_code: bool) -> Vec<LibraryInfo> {
        let state = self.lock();
        state
            .current
            .libraries()
            .filter(|library| library_pattern.map_or(true, |p| library.name().contains(p)))
            .map(|library| LibraryInfo {
                name: library.name().to_string(),
                engine: library.engine().to_string(),
                functions: library
                    .functions()
                    .map(|f| FunctionInfo {
                        name: f.name().to_string(),
                        description: f.description().map(str::to_string),
                        flags: f.flags(),
                    })
                    .collect(),
                code: with_code.then(|| library.code().to_string()),
            })
            .collect()
    }

    /// FUNCTION STATS: per-engine counts in registration order
    pub fn stats(&self) -> Vec<(String, EngineStats)> {
        let state = self.lock();
        state
            .engines
            .iter()
            .map(|d| (d.name.clone(), state.current.engine_stats(&d.name)))
            .collect()
    }

    /// FUNCTION DELETE
    pub fn delete(&self, library_name: &str) -> Result<()> {
        let mut state = self.lock();
        let library = state
            .current
            .remove(library_name)
            .ok_or_else(|| FunctionsError::LibraryNotFound(library_name.to_string()))?;
        state.release_library(library);
        drop(state);

        self.mark_dirty();
        info!(library = library_name, "Library deleted");
        Ok(())
    }

    /// FUNCTION FLUSH. Without a mode the configured default applies.
    pub fn flush(&self, mode: Option<FlushMode>) {
        let mode = mode.unwrap_or(if self.config().lazyfree_flush {
            FlushMode::Async
        } else {
            FlushMode::Sync
        });

        match mode {
            FlushMode::Sync => {
                let mut state = self.lock();
                let libraries = state.current.clear();
                let count = libraries.len();
                for library in libraries {
                    state.release_library(library);
                }
                drop(state);
                info!(libraries = count, "Functions flushed");
            }
            FlushMode::Async => {
                let old = {
                    let mut state = self.lock();
                    let engines = state.engines.iter().map(|d| d.name.as_str());
                    let fresh = FunctionsContext::new(engines);
                    state.displace(fresh)
                };
                info!(libraries = old.library_count(), "Functions flushed asynchronously");
                self.dispose_in_background(old);
            }
        }

        self.mark_dirty();
    }

    fn dispose_in_background(&self, old: FunctionsContext) {
        if old.library_count() == 0 {
            return;
        }

        let registry = self.clone();
        let (tx, rx) = std::sync::mpsc::channel::<FunctionsContext>();
        let spawned = thread::Builder::new()
            .name("functions-lazyfree".to_string())
            .spawn(move || {
                if let Ok(ctx) = rx.recv() {
                    registry.dispose(ctx);
                }
            });

        match spawned {
            Ok(handle) => {
                self.track_lazyfree(handle);
                if let Err(std::sync::mpsc::SendError(ctx)) = tx.send(old) {
                    self.dispose(ctx);
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to spawn lazyfree thread, releasing inline");
                self.dispose(old);
            }
        }
    }

    /// FUNCTION DUMP: serialize every library
    pub fn dump(&self) -> Bytes {
        let state = self.lock();
        let mut writer = DumpWriter::new();
        for library in state.current.libraries() {
            writer.write_library(library.engine(), library.name(), library.code());
        }
        writer.finish()
    }

    /// FUNCTION RESTORE. Returns the number of libraries restored.
    ///
    /// Records naming unknown engines or failing to load are skipped.
    pub fn restore(&self, payload: &[u8], policy: RestorePolicy) -> Result<usize> {
        let records = dump::decode(payload)?;
        let timeout = self.config().load_timeout();

        let mut state = self.lock();
        if policy == RestorePolicy::Flush {
            for library in state.current.clear() {
                state.release_library(library);
            }
        }

        let mut restored = 0;
        for record in &records {
            let exists = state.current.library(&record.name).is_some();
            if policy == RestorePolicy::Append && exists {
                debug!(library = %record.name, "Skipping existing library on restore");
                continue;
            }

            let meta = match metadata::parse(&record.code) {
                Ok(meta) if meta.name == record.name => meta,
                Ok(meta) => {
                    warn!(
                        library = %record.name,
                        header = meta.name,
                        "Skipping restore record with mismatched library name"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        library = %record.name,
                        error = %e,
                        "Skipping malformed restore record"
                    );
                    continue;
                }
            };

            let replace = policy == RestorePolicy::Replace;
            let installed = state.install(
                &record.engine,
                meta.name,
                &record.code,
                meta.body,
                replace,
                timeout,
            );
            match installed {
                Ok(()) => restored += 1,
                Err(e) => warn!(
                    library = %record.name,
                    engine = %record.engine,
                    error = %e,
                    "Skipping restore record"
                ),
            }
        }
        drop(state);

        if restored > 0 || policy == RestorePolicy::Flush {
            self.mark_dirty();
        }
        info!(
            restored,
            records = records.len(),
            policy = ?policy,
            "Functions restored"
        );
        Ok(restored)
    }

    /// FUNCTION KILL. Nothing can be running while a command holds the lock.
    pub fn kill(&self) -> Result<()> {
        Err(FunctionsError::NotBusy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_reports_not_busy() {
        let registry = FunctionsRegistry::new();
        assert!(matches!(registry.kill(), Err(FunctionsError::NotBusy)));
    }

    #[test]
    fn test_load_rejects_unknown_engine() {
        let registry = FunctionsRegistry::new();
        let err = registry.load("#!nope name=lib\nreturn 1", false).unwrap_err();
        assert!(matches!(err, FunctionsError::EngineNotFound(e) if e == "nope"));
        assert_eq!(registry.library_count(), 0);
    }

    #[test]
    fn test_empty_registry_dump_restores_nothing() {
        let registry = FunctionsRegistry::new();
        let payload = registry.dump();
        assert_eq!(registry.restore(&payload, RestorePolicy::default()).unwrap(), 0);
        assert!(matches!(
            registry.restore(b"not a dump", RestorePolicy::Append),
            Err(FunctionsError::PayloadMalformed(_))
        ));
    }

    #[test]
    fn test_flush_and_delete_on_empty_registry() {
        let registry = FunctionsRegistry::new();
        registry.flush(Some(FlushMode::Sync));
        registry.flush(Some(FlushMode::Async));
        registry.flush(None);
        assert!(registry.list(None, false).is_empty());
        assert!(matches!(
            registry.delete("missing"),
            Err(FunctionsError::LibraryNotFound(_))
        ));
    }
}
