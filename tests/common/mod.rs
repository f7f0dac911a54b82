//! Shared test utilities for ferrite-functions integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use ferrite_functions::commands::execute_frames;
use ferrite_functions::config::FunctionsConfig;
use ferrite_functions::error::{FunctionsError, Result};
use ferrite_functions::functions::{
    CompiledFunction, DirtyCounter, Engine, FunctionFlags, FunctionsRegistry, InvocationContext,
    LibraryBuilder,
};
use ferrite_functions::protocol::Frame;

// ============================================================================
// Test engine
// ============================================================================

/// Behaviour of a function compiled by [`OpEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Integer reply of twice the first argument
    Double,
    /// Integer reply of the number of keys
    CountKeys,
    /// Bulk reply of the first key
    FirstKey,
    /// Always fails
    Fail,
}

/// Minimal engine with a line-based library language.
///
/// Each non-empty body line is `<function> <op> [flag ...]`, where `op` is
/// one of `double`, `count_keys`, `first_key` or `fail`. Live handles are
/// counted so tests can check nothing leaks.
pub struct OpEngine {
    live: Arc<AtomicUsize>,
}

impl OpEngine {
    pub fn new(live: Arc<AtomicUsize>) -> Self {
        Self { live }
    }
}

impl Engine for OpEngine {
    fn compile(
        &mut self,
        library: &mut LibraryBuilder,
        code: &str,
        _timeout: Duration,
    ) -> Result<()> {
        for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut words = line.split_whitespace();
            let name = words.next().unwrap_or_default();
            let op = match words.next() {
                Some("double") => Op::Double,
                Some("count_keys") => Op::CountKeys,
                Some("first_key") => Op::FirstKey,
                Some("fail") => Op::Fail,
                other => {
                    return Err(FunctionsError::CompileError(format!(
                        "unknown op {other:?} on line '{line}'"
                    )))
                }
            };

            let mut flags = FunctionFlags::empty();
            for word in words {
                flags |= FunctionFlags::from_name(word).ok_or_else(|| {
                    FunctionsError::CompileError(format!("unknown flag '{word}'"))
                })?;
            }

            self.live.fetch_add(1, Ordering::SeqCst);
            library.create_function(name, CompiledFunction::custom(op), None, flags)?;
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        _ctx: &InvocationContext<'_>,
        function: &CompiledFunction,
        keys: &[Bytes],
        args: &[Bytes],
    ) -> Result<Frame> {
        let op = function
            .downcast_ref::<Op>()
            .ok_or_else(|| FunctionsError::ExecutionError("foreign handle".to_string()))?;

        match op {
            Op::Double => {
                let n: i64 = args
                    .first()
                    .and_then(|a| std::str::from_utf8(a).ok())
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| FunctionsError::ExecutionError("not a number".to_string()))?;
                Ok(Frame::Integer(n * 2))
            }
            Op::CountKeys => Ok(Frame::Integer(keys.len() as i64)),
            Op::FirstKey => Ok(keys.first().cloned().map_or_else(Frame::null, Frame::bulk)),
            Op::Fail => Err(FunctionsError::ExecutionError("boom".to_string())),
        }
    }

    fn used_memory(&self) -> usize {
        4096
    }

    fn function_overhead(&self, _function: &CompiledFunction) -> usize {
        32
    }

    fn engine_overhead(&self) -> usize {
        128
    }

    fn release_function(&mut self, _function: CompiledFunction) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Registry helpers
// ============================================================================

/// A registry with [`OpEngine`] registered as `X`
#[allow(dead_code)]
pub struct TestRegistry {
    pub registry: FunctionsRegistry,
    pub live: Arc<AtomicUsize>,
    pub dirty: Arc<DirtyCounter>,
}

/// Create a registry with [`OpEngine`] registered as `X`
#[allow(dead_code)]
pub fn op_registry() -> TestRegistry {
    op_registry_with(FunctionsConfig::default())
}

/// Same as [`op_registry`] with explicit settings
#[allow(dead_code)]
pub fn op_registry_with(config: FunctionsConfig) -> TestRegistry {
    let live = Arc::new(AtomicUsize::new(0));
    let dirty = Arc::new(DirtyCounter::new());
    let registry = FunctionsRegistry::with_config(config, dirty.clone());
    registry
        .register_engine("X", Box::new(OpEngine::new(live.clone())))
        .unwrap();
    TestRegistry {
        registry,
        live,
        dirty,
    }
}

/// Library source for engine `X`
#[allow(dead_code)]
pub fn library(name: &str, lines: &[&str]) -> String {
    format!("#!x name={name}\n{}\n", lines.join("\n"))
}

/// Run one request given as plain strings
#[allow(dead_code)]
pub fn run(registry: &FunctionsRegistry, args: &[&str]) -> Frame {
    let frames: Vec<Frame> = args.iter().map(|a| Frame::bulk(a.to_string())).collect();
    execute_frames(registry, &frames)
}

/// Wait until `live` drops to `expected`, for background disposal
#[allow(dead_code)]
pub fn wait_for_live(live: &AtomicUsize, expected: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if live.load(Ordering::SeqCst) == expected {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
