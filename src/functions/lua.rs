//! Lua function engine
//!
//! Library code runs once in a long-lived Lua 5.4 interpreter and registers
//! its functions with `redis.register_function`:
//!
//! ```lua
//! #!lua name=mylib
//! redis.register_function('double', function(keys, args)
//!     return tonumber(args[1]) * 2
//! end)
//!
//! redis.register_function{
//!     function_name = 'peek',
//!     callback = function(keys, args) return keys[1] end,
//!     flags = { 'no-writes' },
//!     description = 'returns its first key',
//! }
//! ```
//!
//! Registered callbacks are pinned in the Lua registry until the engine is
//! asked to release them.

use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mlua::{
    Function, HookTriggers, Lua, RegistryKey, Result as LuaResult, Table, Value as LuaValue,
    VmState,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{FunctionsError, Result};
use crate::protocol::Frame;

use super::engine::{CompiledFunction, Engine, InvocationContext};
use super::library::{FunctionFlags, LibraryBuilder};

const LOG_DEBUG: i64 = 0;
const LOG_VERBOSE: i64 = 1;
const LOG_NOTICE: i64 = 2;
const LOG_WARNING: i64 = 3;

/// Instructions between two load-timeout checks
const HOOK_INSTRUCTIONS: u32 = 100_000;

const CHUNK_NAME: &str = "@user_function";

/// Deepest table nesting converted into a reply
const MAX_REPLY_DEPTH: usize = 128;

fn load_timeout_error() -> mlua::Error {
    mlua::Error::RuntimeError("FUNCTION LOAD timeout".to_string())
}

struct PendingFunction {
    name: String,
    callback: RegistryKey,
    description: Option<String>,
    flags: FunctionFlags,
}

/// Functions registered by the library currently being loaded. `None`
/// outside of [`LuaEngine::compile`].
type PendingList = Arc<Mutex<Option<Vec<PendingFunction>>>>;

/// Engine backed by an embedded Lua interpreter
pub struct LuaEngine {
    lua: Lua,
    pending: PendingList,
}

impl LuaEngine {
    /// Create an interpreter with the `redis` API installed
    pub fn new() -> Result<Self> {
        let lua = Lua::new();
        let pending: PendingList = Arc::new(Mutex::new(None));
        setup_lua_env(&lua, pending.clone()).map_err(|e| {
            FunctionsError::CompileError(format!("Failed to initialize Lua engine: {e}"))
        })?;
        Ok(Self { lua, pending })
    }

    fn bytes_table(&self, values: &[Bytes]) -> LuaResult<Table> {
        let table = self.lua.create_table_with_capacity(values.len(), 0)?;
        for (i, value) in values.iter().enumerate() {
            table.set(i + 1, self.lua.create_string(value.as_ref())?)?;
        }
        Ok(table)
    }

    fn run_chunk(&self, code: &str, timeout: Duration) -> LuaResult<()> {
        let deadline = Instant::now() + timeout;
        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = timed_out.clone();
        self.lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTIONS),
            move |lua, _debug| {
                if Instant::now() < deadline {
                    return Ok(VmState::Continue);
                }
                // Keep failing on every line so pcall cannot swallow the timeout
                flag.store(true, Ordering::Relaxed);
                lua.set_hook(HookTriggers::EVERY_LINE, |_lua, _debug| {
                    Err(load_timeout_error())
                });
                Err(load_timeout_error())
            },
        );
        let result = self.lua.load(code).set_name(CHUNK_NAME).exec();
        self.lua.remove_hook();

        if timed_out.load(Ordering::Relaxed) {
            return Err(load_timeout_error());
        }
        result
    }

    fn unpin(&self, key: RegistryKey) {
        if let Err(e) = self.lua.remove_registry_value(key) {
            debug!(error = %e, "Failed to remove Lua registry value");
        }
    }
}

impl Engine for LuaEngine {
    fn compile(
        &mut self,
        library: &mut LibraryBuilder,
        code: &str,
        timeout: Duration,
    ) -> Result<()> {
        *self.pending.lock() = Some(Vec::new());
        let result = self.run_chunk(code, timeout);
        let pending = self.pending.lock().take().unwrap_or_default();

        if let Err(e) = result {
            for function in pending {
                self.unpin(function.callback);
            }
            return Err(FunctionsError::CompileError(e.to_string()));
        }

        let mut pending = pending.into_iter();
        while let Some(function) = pending.next() {
            let registered = library.create_function(
                function.name,
                CompiledFunction::Lua(function.callback),
                function.description,
                function.flags,
            );
            if let Err(e) = registered {
                for rest in pending {
                    self.unpin(rest.callback);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        ctx: &InvocationContext<'_>,
        function: &CompiledFunction,
        keys: &[Bytes],
        args: &[Bytes],
    ) -> Result<Frame> {
        let CompiledFunction::Lua(key) = function else {
            return Err(FunctionsError::InvalidFunctionReference(
                ctx.function.to_string(),
            ));
        };

        let call = || -> LuaResult<LuaValue> {
            let callback: Function = self.lua.registry_value(key)?;
            callback.call((self.bytes_table(keys)?, self.bytes_table(args)?))
        };
        let value = call().map_err(|e| FunctionsError::ExecutionError(e.to_string()))?;
        lua_value_to_frame(value)
    }

    fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    fn function_overhead(&self, _function: &CompiledFunction) -> usize {
        mem::size_of::<RegistryKey>()
    }

    fn engine_overhead(&self) -> usize {
        mem::size_of::<Self>()
    }

    fn release_function(&mut self, function: CompiledFunction) {
        if let CompiledFunction::Lua(key) = function {
            self.unpin(key);
        }
    }

    fn release(self: Box<Self>) {
        self.lua.expire_registry_values();
        debug!(memory = self.lua.used_memory(), "Lua engine released");
    }
}

/// Install the `redis` table library code runs against
fn setup_lua_env(lua: &Lua, pending: PendingList) -> LuaResult<()> {
    let redis_table = lua.create_table()?;

    // redis.register_function(name, callback) or redis.register_function{...}
    let register_fn = lua.create_function(
        move |lua_ctx, (first, second): (LuaValue, Option<Function>)| {
            let function = parse_registration(first, second)?;
            let mut pending = pending.lock();
            let list = pending.as_mut().ok_or_else(|| {
                mlua::Error::RuntimeError(
                    "redis.register_function can only be called on FUNCTION LOAD command"
                        .to_string(),
                )
            })?;
            let (name, callback, description, flags) = function;
            list.push(PendingFunction {
                name,
                callback: lua_ctx.create_registry_value(callback)?,
                description,
                flags,
            });
            Ok(())
        },
    )?;
    redis_table.set("register_function", register_fn)?;

    // redis.status_reply(msg) -- Return a status reply table {ok = msg}
    let status_reply_fn = lua.create_function(|lua_ctx, msg: String| {
        let table = lua_ctx.create_table()?;
        table.set("ok", msg)?;
        Ok(LuaValue::Table(table))
    })?;
    redis_table.set("status_reply", status_reply_fn)?;

    // redis.error_reply(msg) -- Return an error reply table {err = msg}
    let error_reply_fn = lua.create_function(|lua_ctx, msg: String| {
        let table = lua_ctx.create_table()?;
        table.set("err", msg)?;
        Ok(LuaValue::Table(table))
    })?;
    redis_table.set("error_reply", error_reply_fn)?;

    let log_fn = lua.create_function(|_lua_ctx, (level, msg): (i64, String)| {
        match level {
            l if l == LOG_DEBUG => tracing::debug!(target: "lua_function", "{}", msg),
            l if l == LOG_VERBOSE => tracing::info!(target: "lua_function", "{}", msg),
            l if l == LOG_NOTICE => tracing::info!(target: "lua_function", "{}", msg),
            l if l == LOG_WARNING => tracing::warn!(target: "lua_function", "{}", msg),
            _ => {
                return Err(mlua::Error::RuntimeError(
                    "Invalid debug level.".to_string(),
                ))
            }
        }
        Ok(())
    })?;
    redis_table.set("log", log_fn)?;

    redis_table.set("LOG_DEBUG", LOG_DEBUG)?;
    redis_table.set("LOG_VERBOSE", LOG_VERBOSE)?;
    redis_table.set("LOG_NOTICE", LOG_NOTICE)?;
    redis_table.set("LOG_WARNING", LOG_WARNING)?;

    lua.globals().set("redis", redis_table)?;
    Ok(())
}

type Registration = (String, Function, Option<String>, FunctionFlags);

fn parse_registration(first: LuaValue, second: Option<Function>) -> LuaResult<Registration> {
    match first {
        LuaValue::String(name) => {
            let callback = second.ok_or_else(|| {
                mlua::Error::RuntimeError(
                    "wrong number of arguments to redis.register_function".to_string(),
                )
            })?;
            Ok((
                name.to_string_lossy(),
                callback,
                None,
                FunctionFlags::empty(),
            ))
        }
        LuaValue::Table(t) if second.is_none() => {
            let name: Option<String> = t.get("function_name")?;
            let callback: Option<Function> = t.get("callback")?;
            let description: Option<String> = t.get("description")?;
            let flags = match t.get::<Option<Table>>("flags")? {
                Some(flags) => parse_flags(flags)?,
                None => FunctionFlags::empty(),
            };

            match (name, callback) {
                (Some(name), Some(callback)) => Ok((name, callback, description, flags)),
                (None, _) => Err(mlua::Error::RuntimeError(
                    "redis.register_function must get a function name argument".to_string(),
                )),
                (_, None) => Err(mlua::Error::RuntimeError(
                    "redis.register_function must get a callback argument".to_string(),
                )),
            }
        }
        _ => Err(mlua::Error::RuntimeError(
            "calling redis.register_function with a single argument is only applicable to Lua table"
                .to_string(),
        )),
    }
}

fn parse_flags(table: Table) -> LuaResult<FunctionFlags> {
    let mut flags = FunctionFlags::empty();
    for name in table.sequence_values::<String>() {
        let name = name?;
        flags |= FunctionFlags::from_name(&name).ok_or_else(|| {
            mlua::Error::RuntimeError(format!("unknown flag given: {name}"))
        })?;
    }
    Ok(flags)
}

/// Convert a callback's return value into a reply
fn lua_value_to_frame(value: LuaValue) -> Result<Frame> {
    let mut path = Vec::new();
    convert_value(value, &mut path)
}

/// `path` holds the tables currently being converted, outermost first
fn convert_value(value: LuaValue, path: &mut Vec<*const c_void>) -> Result<Frame> {
    let frame = match value {
        LuaValue::Nil => Frame::null(),
        LuaValue::Boolean(false) => Frame::null(),
        LuaValue::Boolean(true) => Frame::Integer(1),
        LuaValue::Integer(n) => Frame::Integer(n),
        LuaValue::Number(n) => {
            // Floats are truncated to integers, as Redis does
            if n.is_finite() && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
                Frame::Integer(n as i64)
            } else {
                Frame::bulk(Bytes::from(n.to_string()))
            }
        }
        LuaValue::String(s) => Frame::bulk(Bytes::from(s.as_bytes().to_vec())),
        LuaValue::Table(t) => {
            if let Ok(LuaValue::String(s)) = t.get::<LuaValue>("ok") {
                return Ok(Frame::simple(s.to_string_lossy()));
            }
            if let Ok(LuaValue::String(s)) = t.get::<LuaValue>("err") {
                return Ok(Frame::error(s.to_string_lossy()));
            }

            // A table nested inside itself would never terminate
            let ptr = t.to_pointer();
            if path.len() >= MAX_REPLY_DEPTH || path.contains(&ptr) {
                return Err(FunctionsError::ExecutionError(
                    "reached lua stack limit".to_string(),
                ));
            }
            path.push(ptr);

            // 1-indexed sequence, stops at the first nil
            let mut frames = Vec::new();
            let mut i = 1;
            while let Ok(v) = t.get::<LuaValue>(i) {
                if matches!(v, LuaValue::Nil) {
                    break;
                }
                frames.push(convert_value(v, path)?);
                i += 1;
            }
            path.pop();
            Frame::array(frames)
        }
        _ => Frame::null(),
    };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{CallMode, FunctionsRegistry};

    fn registry() -> FunctionsRegistry {
        let registry = FunctionsRegistry::new();
        registry
            .register_engine("LUA", Box::new(LuaEngine::new().unwrap()))
            .unwrap();
        registry
    }

    fn args(values: &[&str]) -> Vec<Bytes> {
        values.iter().map(|v| Bytes::from(v.to_string())).collect()
    }

    const DOUBLE: &str = "#!lua name=math\n\
        redis.register_function('double', function(keys, args)\n\
            return tonumber(args[1]) * 2\n\
        end)\n";

    #[test]
    fn test_load_and_call() {
        let registry = registry();
        assert_eq!(registry.load(DOUBLE, false).unwrap(), "math");

        let reply = registry
            .call("double", 1, &args(&["k1", "5"]), CallMode::Write)
            .unwrap();
        assert_eq!(reply, Frame::Integer(10));
    }

    #[test]
    fn test_keys_and_args_tables() {
        let registry = registry();
        let code = "#!lua name=echo\n\
            redis.register_function{\n\
                function_name = 'echo',\n\
                callback = function(keys, args) return {keys[1], keys[2], args[1], #args} end,\n\
                flags = {'no-writes'},\n\
                description = 'echoes input',\n\
            }\n";
        registry.load(code, false).unwrap();

        let reply = registry
            .call("echo", 2, &args(&["a", "b", "c"]), CallMode::ReadOnly)
            .unwrap();
        assert_eq!(
            reply,
            Frame::array(vec![
                Frame::bulk("a"),
                Frame::bulk("b"),
                Frame::bulk("c"),
                Frame::Integer(1),
            ])
        );

        let libraries = registry.list(None, false);
        let echo = &libraries[0].functions[0];
        assert_eq!(echo.description.as_deref(), Some("echoes input"));
        assert!(echo.flags.contains(FunctionFlags::NO_WRITES));
    }

    #[test]
    fn test_status_and_error_replies() {
        let registry = registry();
        let code = "#!lua name=replies\n\
            redis.register_function('ok', function() return redis.status_reply('FINE') end)\n\
            redis.register_function('bad', function() return redis.error_reply('ERR nope') end)\n\
            redis.register_function('boom', function() error('exploded') end)\n";
        registry.load(code, false).unwrap();

        let ok = registry.call("ok", 0, &[], CallMode::Write).unwrap();
        assert_eq!(ok, Frame::simple("FINE"));
        let bad = registry.call("bad", 0, &[], CallMode::Write).unwrap();
        assert_eq!(bad, Frame::error("ERR nope"));

        let err = registry.call("boom", 0, &[], CallMode::Write).unwrap_err();
        assert!(matches!(err, FunctionsError::ExecutionError(msg) if msg.contains("exploded")));
    }

    #[test]
    fn test_compile_failures_leave_registry_untouched() {
        let registry = registry();
        let cases = [
            "#!lua name=broken\nthis is not lua",
            "#!lua name=empty\nlocal x = 1",
            "#!lua name=badflag\nredis.register_function{function_name='f', callback=function() end, flags={'sometimes'}}",
            "#!lua name=badname\nredis.register_function('bad-name', function() end)",
            "#!lua name=twice\nredis.register_function('f', function() end)\nredis.register_function('f', function() end)",
        ];
        for code in cases {
            assert!(registry.load(code, false).is_err(), "expected failure: {code}");
        }
        assert_eq!(registry.library_count(), 0);
        assert_eq!(registry.function_count(), 0);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_register_outside_load_fails() {
        let registry = registry();
        let code = "#!lua name=sneaky\n\
            redis.register_function('late', function()\n\
                redis.register_function('later', function() return 1 end)\n\
            end)\n";
        registry.load(code, false).unwrap();

        let err = registry.call("late", 0, &[], CallMode::Write).unwrap_err();
        assert!(matches!(err, FunctionsError::ExecutionError(msg) if msg.contains("FUNCTION LOAD")));
        assert_eq!(registry.function_count(), 1);
    }

    #[test]
    fn test_load_timeout() {
        let registry = registry();
        let code = "#!lua name=spin\nwhile true do end";
        let err = registry
            .load_with_timeout(code, false, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, FunctionsError::CompileError(msg) if msg.contains("timeout")));
        assert_eq!(registry.library_count(), 0);

        // The hook is gone once the load returns
        registry.load(DOUBLE, false).unwrap();
    }

    #[test]
    fn test_timeout_survives_pcall() {
        let registry = registry();
        let code = "#!lua name=stubborn\n\
            while true do pcall(function() while true do end end) end\n\
            redis.register_function('f', function() return 1 end)\n";
        let err = registry
            .load_with_timeout(code, false, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, FunctionsError::CompileError(msg) if msg.contains("timeout")));

        // A load that caught the timeout and then finished still fails
        let code = "#!lua name=bounded\n\
            local n = 0\n\
            local start = os.clock()\n\
            while os.clock() - start < 0.2 do pcall(function() n = n + 1 end) end\n\
            redis.register_function('g', function() return n end)\n";
        let err = registry
            .load_with_timeout(code, false, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, FunctionsError::CompileError(msg) if msg.contains("timeout")));
        assert_eq!(registry.library_count(), 0);
    }

    #[test]
    fn test_compile_error_line_numbers_match_source() {
        let registry = registry();
        let code = "#!lua name=lines\nlocal x = 1\nerror('bad line')\n";
        let err = registry.load(code, false).unwrap_err();
        assert!(
            matches!(&err, FunctionsError::CompileError(msg) if msg.contains("user_function:3:")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_self_referencing_reply_is_an_error() {
        let registry = registry();
        let code = "#!lua name=cycles\n\
            redis.register_function('cyc', function() local t = {} t[1] = t return t end)\n\
            redis.register_function('wide', function() local t = {} t[1] = t t[2] = t return t end)\n\
            redis.register_function('deep', function()\n\
                local t = {}\n\
                for i = 1, 1000 do t = {t} end\n\
                return t\n\
            end)\n\
            redis.register_function('shared', function() local a = {1} return {a, a} end)\n";
        registry.load(code, false).unwrap();

        for name in ["cyc", "wide", "deep"] {
            let err = registry.call(name, 0, &[], CallMode::Write).unwrap_err();
            assert!(
                matches!(&err, FunctionsError::ExecutionError(msg) if msg == "reached lua stack limit"),
                "{name}: {err}"
            );
        }

        // Repeated, non-nested tables are fine
        let reply = registry.call("shared", 0, &[], CallMode::Write).unwrap();
        let inner = Frame::array(vec![Frame::Integer(1)]);
        assert_eq!(reply, Frame::array(vec![inner.clone(), inner]));
    }

    #[test]
    fn test_lua_value_conversion() {
        let lua = Lua::new();
        assert_eq!(lua_value_to_frame(LuaValue::Nil).unwrap(), Frame::null());
        assert_eq!(
            lua_value_to_frame(LuaValue::Boolean(true)).unwrap(),
            Frame::Integer(1)
        );
        assert_eq!(
            lua_value_to_frame(LuaValue::Number(3.7)).unwrap(),
            Frame::Integer(3)
        );

        let table: Table = lua.load("return {1, 'two', {3}}").eval().unwrap();
        assert_eq!(
            lua_value_to_frame(LuaValue::Table(table)).unwrap(),
            Frame::array(vec![
                Frame::Integer(1),
                Frame::bulk("two"),
                Frame::array(vec![Frame::Integer(3)]),
            ])
        );
    }
}
