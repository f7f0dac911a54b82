//! FCALL / FCALL_RO

use bytes::Bytes;
use tracing::warn;

use crate::error::{FunctionsError, Result};
use crate::protocol::Frame;

use super::engine::InvocationContext;
use super::library::FunctionFlags;
use super::registry::FunctionsRegistry;

/// Whether a call may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// FCALL
    Write,
    /// FCALL_RO; only `no-writes` functions may run
    ReadOnly,
}

/// Split `trailing` into keys and args according to `numkeys`
pub fn split_keys(numkeys: i64, trailing: &[Bytes]) -> Result<(&[Bytes], &[Bytes])> {
    if numkeys < 0 {
        return Err(FunctionsError::ArgumentCountError(
            "Number of keys can't be negative",
        ));
    }
    let numkeys = usize::try_from(numkeys).unwrap_or(usize::MAX);
    if numkeys > trailing.len() {
        return Err(FunctionsError::ArgumentCountError(
            "Number of keys can't be greater than number of args",
        ));
    }
    Ok(trailing.split_at(numkeys))
}

impl FunctionsRegistry {
    /// Call a function by name with the given keys and arguments.
    ///
    /// The registry lock is held for the whole call.
    pub fn call(
        &self,
        function: &str,
        numkeys: i64,
        trailing: &[Bytes],
        mode: CallMode,
    ) -> Result<Frame> {
        let (keys, args) = split_keys(numkeys, trailing)?;

        let mut guard = self.lock();
        let state = &mut *guard;

        let entry = state.current.resolve(function)?;
        let library = entry.library();
        let idx = state
            .current
            .library(library)
            .and_then(|lib| state.engine_index(lib.engine()))
            .ok_or_else(|| FunctionsError::InvalidFunctionReference(function.to_string()))?;

        let read_only = mode == CallMode::ReadOnly;
        if read_only && !entry.flags().contains(FunctionFlags::NO_WRITES) {
            return Err(FunctionsError::WriteOnReadOnlyCall);
        }

        let descriptor = &mut state.engines[idx];
        let ctx = InvocationContext {
            client: &descriptor.client,
            function,
            read_only,
        };
        let result = descriptor.engine.invoke(&ctx, entry.handle(), keys, args);
        if let Err(e) = &result {
            warn!(function, library, error = %e, "Function call failed");
        }
        drop(guard);

        if !read_only {
            self.mark_dirty();
        }
        result
    }
}
