//! # ferrite-functions
//!
//! Server-side functions for Ferrite: the `FUNCTION` / `FCALL` / `FCALL_RO`
//! subsystem of a Redis-compatible server.
//!
//! Clients load named libraries of code, each registering one or more
//! functions, and call those functions by name with a set of keys and
//! arguments. Execution is delegated to pluggable engines; a Lua 5.4 engine
//! is built in behind the `lua` feature.
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`functions`] | Engine contract, registry, library lifecycle, invocation |
//! | [`commands`] | Parsing and execution of FUNCTION / FCALL requests |
//! | [`protocol`] | RESP reply frames and encoder |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error type and RESP error rendering |
//!
//! ## Example
//!
//! ```ignore
//! use ferrite_functions::commands::execute_frames;
//! use ferrite_functions::protocol::Frame;
//!
//! let registry = FunctionsRegistry::with_builtin_engines(config, tracker)?;
//! let reply = execute_frames(&registry, &[
//!     Frame::bulk("FCALL"), Frame::bulk("double"), Frame::bulk("1"),
//!     Frame::bulk("k1"), Frame::bulk("5"),
//! ]);
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod functions;
pub mod protocol;

pub use error::{FunctionsError, Result};
pub use functions::FunctionsRegistry;
