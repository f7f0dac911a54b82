//! Libraries and the functions they register
//!
//! A [`Library`] is only ever produced by committing a [`LibraryBuilder`]
//! after its engine compiled the source successfully. Engines register
//! functions into the builder; nothing touches the live context until the
//! registry commits.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{FunctionsError, Result};

use super::engine::CompiledFunction;

/// Per-function flag set declared at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FunctionFlags(u64);

impl FunctionFlags {
    /// Function never writes; required for FCALL_RO
    pub const NO_WRITES: FunctionFlags = FunctionFlags(1 << 0);
    /// Function may run when the server is out of memory
    pub const ALLOW_OOM: FunctionFlags = FunctionFlags(1 << 1);
    /// Function may run against a stale replica
    pub const ALLOW_STALE: FunctionFlags = FunctionFlags(1 << 2);
    /// Function refuses to run in cluster mode
    pub const NO_CLUSTER: FunctionFlags = FunctionFlags(1 << 3);
    /// Function may access keys from different slots
    pub const ALLOW_CROSS_SLOT: FunctionFlags = FunctionFlags(1 << 4);

    const NAMES: [(FunctionFlags, &'static str); 5] = [
        (Self::NO_WRITES, "no-writes"),
        (Self::ALLOW_OOM, "allow-oom"),
        (Self::ALLOW_STALE, "allow-stale"),
        (Self::NO_CLUSTER, "no-cluster"),
        (Self::ALLOW_CROSS_SLOT, "allow-cross-slot-keys"),
    ];

    /// The empty flag set
    pub const fn empty() -> Self {
        FunctionFlags(0)
    }

    /// True when every bit of `other` is set
    pub const fn contains(self, other: FunctionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no flag is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parse a flag by its script-facing name (e.g. `no-writes`)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(flag, _)| *flag)
    }

    /// Script-facing names of the set flags, in declaration order
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl BitOr for FunctionFlags {
    type Output = FunctionFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FunctionFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FunctionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Check a function or library name against `[A-Za-z0-9_]+`.
pub fn verify_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// One invocable unit registered by a library.
pub struct FunctionEntry {
    name: String,
    library: String,
    handle: CompiledFunction,
    description: Option<String>,
    flags: FunctionFlags,
}

impl FunctionEntry {
    /// Function name, unique across the whole context
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning library
    pub fn library(&self) -> &str {
        &self.library
    }

    /// Engine-owned compiled handle
    pub fn handle(&self) -> &CompiledFunction {
        &self.handle
    }

    /// Optional human-readable description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Declared flags
    pub fn flags(&self) -> FunctionFlags {
        self.flags
    }

    /// Bytes held by the entry itself, excluding the engine's handle overhead
    pub(crate) fn malloc_size(&self) -> usize {
        mem::size_of::<Self>()
            + self.name.len()
            + self.description.as_ref().map_or(0, String::len)
    }

    pub(crate) fn into_handle(self) -> CompiledFunction {
        self.handle
    }
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("name", &self.name)
            .field("library", &self.library)
            .field("description", &self.description)
            .field("flags", &self.flags.names())
            .finish()
    }
}

/// A loaded bundle of source code and the functions it registered.
#[derive(Debug)]
pub struct Library {
    name: String,
    engine: String,
    code: String,
    functions: BTreeMap<String, FunctionEntry>,
}

impl Library {
    /// Library name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical name of the owning engine
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Full source code as submitted, metadata header included
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Functions keyed by name
    pub fn functions(&self) -> impl Iterator<Item = &FunctionEntry> {
        self.functions.values()
    }

    /// Look up one of this library's functions
    pub fn function(&self, name: &str) -> Option<&FunctionEntry> {
        self.functions.get(name)
    }

    /// Number of functions
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub(crate) fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Bytes held by the library record, excluding its functions
    pub(crate) fn malloc_size(&self) -> usize {
        mem::size_of::<Self>() + self.name.len() + self.code.len()
    }

    /// Take the compiled handles out so they can be released by the engine
    pub(crate) fn into_handles(self) -> impl Iterator<Item = CompiledFunction> {
        self.functions.into_values().map(FunctionEntry::into_handle)
    }
}

/// Staging area an engine registers functions into while compiling.
pub struct LibraryBuilder {
    name: String,
    engine: String,
    code: String,
    functions: BTreeMap<String, FunctionEntry>,
    rejected: Vec<CompiledFunction>,
}

impl LibraryBuilder {
    pub(crate) fn new(name: &str, engine: &str, code: &str) -> Self {
        Self {
            name: name.to_string(),
            engine: engine.to_string(),
            code: code.to_string(),
            functions: BTreeMap::new(),
            rejected: Vec::new(),
        }
    }

    /// Name of the library being built
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine the library is being built for
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Number of functions registered so far
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Register a compiled function under `name`.
    ///
    /// A rejected handle is kept aside and released through the engine along
    /// with the rest of the staged library if the load is abandoned.
    pub fn create_function(
        &mut self,
        name: impl Into<String>,
        handle: CompiledFunction,
        description: Option<String>,
        flags: FunctionFlags,
    ) -> Result<()> {
        let name = name.into();
        if !verify_name(&name) {
            self.rejected.push(handle);
            return Err(FunctionsError::InvalidName("Function"));
        }
        if self.functions.contains_key(&name) {
            self.rejected.push(handle);
            return Err(FunctionsError::FunctionExists(name));
        }

        let entry = FunctionEntry {
            name: name.clone(),
            library: self.name.clone(),
            handle,
            description,
            flags,
        };
        self.functions.insert(name, entry);
        Ok(())
    }

    /// Split into the library to commit and handles that were never accepted
    pub(crate) fn finish(self) -> (Library, Vec<CompiledFunction>) {
        let library = Library {
            name: self.name,
            engine: self.engine,
            code: self.code,
            functions: self.functions,
        };
        (library, self.rejected)
    }

    /// Every handle held by the builder, accepted or not
    pub(crate) fn into_handles(self) -> Vec<CompiledFunction> {
        let (library, mut handles) = self.finish();
        handles.extend(library.into_handles());
        handles
    }
}
