//! FUNCTION / FCALL / FCALL_RO command surface
//!
//! [`parse_command`] turns a request's argument vector into a [`Command`];
//! [`execute`] runs it against a registry and renders the reply.

mod handler;
mod parser;

pub use handler::{execute, execute_frames};
pub use parser::{parse_command, parse_function, Command, FunctionCommand};
