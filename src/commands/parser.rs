//! Argument parsing for FUNCTION, FCALL and FCALL_RO
//!
//! Input is the argument vector of one request, command name first, as the
//! network layer hands it over.

use bytes::Bytes;

use crate::error::{FunctionsError, Result};
use crate::functions::{FlushMode, RestorePolicy};
use crate::protocol::Frame;

/// A parsed request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// FUNCTION <subcommand> ...
    Function(FunctionCommand),
    /// FCALL / FCALL_RO function numkeys [key ...] [arg ...]
    FCall {
        /// Function name
        function: String,
        /// Declared key count, validated against `args` on execution
        numkeys: i64,
        /// Keys followed by plain arguments
        args: Vec<Bytes>,
        /// FCALL_RO
        read_only: bool,
    },
}

/// FUNCTION subcommands
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionCommand {
    /// FUNCTION LOAD [REPLACE] <code>
    Load { replace: bool, code: String },
    /// FUNCTION LIST [LIBRARYNAME <pattern>] [WITHCODE]
    List {
        library_pattern: Option<String>,
        with_code: bool,
    },
    /// FUNCTION STATS
    Stats,
    /// FUNCTION DELETE <library>
    Delete { library: String },
    /// FUNCTION FLUSH [ASYNC|SYNC]
    Flush { mode: Option<FlushMode> },
    /// FUNCTION DUMP
    Dump,
    /// FUNCTION RESTORE <payload> [APPEND|REPLACE|FLUSH]
    Restore {
        payload: Bytes,
        policy: RestorePolicy,
    },
    /// FUNCTION KILL
    Kill,
    /// FUNCTION HELP
    Help,
}

/// Extract a string from a frame
fn get_string(frame: &Frame) -> Result<String> {
    match frame {
        Frame::Simple(b) | Frame::Bulk(Some(b)) => String::from_utf8(b.to_vec())
            .map_err(|_| FunctionsError::Protocol("invalid UTF-8".to_string())),
        _ => Err(FunctionsError::Protocol("expected string".to_string())),
    }
}

/// Extract bytes from a frame
fn get_bytes(frame: &Frame) -> Result<Bytes> {
    match frame {
        Frame::Simple(b) | Frame::Bulk(Some(b)) => Ok(b.clone()),
        _ => Err(FunctionsError::Protocol("expected bulk string".to_string())),
    }
}

/// Extract an integer from a frame
fn get_int(frame: &Frame) -> Result<i64> {
    match frame {
        Frame::Integer(n) => Ok(*n),
        Frame::Simple(b) | Frame::Bulk(Some(b)) => {
            let s = std::str::from_utf8(b)
                .map_err(|_| FunctionsError::Protocol("invalid UTF-8".to_string()))?;
            s.parse().map_err(|_| FunctionsError::NotInteger)
        }
        _ => Err(FunctionsError::NotInteger),
    }
}

/// Parse a full request (command name included)
pub fn parse_command(frames: &[Frame]) -> Result<Command> {
    let (name, args) = frames
        .split_first()
        .ok_or_else(|| FunctionsError::Protocol("empty command".to_string()))?;
    let name = get_string(name)?;

    match name.to_uppercase().as_str() {
        "FUNCTION" => parse_function(args).map(Command::Function),
        "FCALL" => parse_fcall(args, false, "FCALL"),
        "FCALL_RO" => parse_fcall(args, true, "FCALL_RO"),
        _ => Err(FunctionsError::UnknownCommand(name)),
    }
}

fn parse_fcall(args: &[Frame], read_only: bool, command: &str) -> Result<Command> {
    if args.len() < 2 {
        return Err(FunctionsError::WrongArity(command.to_string()));
    }
    let function = get_string(&args[0])?;
    let numkeys = get_int(&args[1])?;
    let args = args[2..].iter().map(get_bytes).collect::<Result<Vec<_>>>()?;

    Ok(Command::FCall {
        function,
        numkeys,
        args,
        read_only,
    })
}

/// Parse the arguments following `FUNCTION`
pub fn parse_function(args: &[Frame]) -> Result<FunctionCommand> {
    let (subcommand, args) = args
        .split_first()
        .ok_or_else(|| FunctionsError::WrongArity("FUNCTION".to_string()))?;
    let subcommand = get_string(subcommand)?.to_uppercase();
    let arity = || FunctionsError::WrongArity(format!("FUNCTION|{}", subcommand.to_lowercase()));

    match subcommand.as_str() {
        "LOAD" => match args {
            [code] => Ok(FunctionCommand::Load {
                replace: false,
                code: get_string(code)?,
            }),
            [option, code] => {
                if !get_string(option)?.eq_ignore_ascii_case("REPLACE") {
                    return Err(FunctionsError::Syntax);
                }
                Ok(FunctionCommand::Load {
                    replace: true,
                    code: get_string(code)?,
                })
            }
            _ => Err(arity()),
        },
        "LIST" => parse_list(args),
        "STATS" if args.is_empty() => Ok(FunctionCommand::Stats),
        "DELETE" => match args {
            [library] => Ok(FunctionCommand::Delete {
                library: get_string(library)?,
            }),
            _ => Err(arity()),
        },
        "FLUSH" => match args {
            [] => Ok(FunctionCommand::Flush { mode: None }),
            [mode] => {
                let mode = match get_string(mode)?.to_uppercase().as_str() {
                    "ASYNC" => FlushMode::Async,
                    "SYNC" => FlushMode::Sync,
                    _ => return Err(FunctionsError::Syntax),
                };
                Ok(FunctionCommand::Flush { mode: Some(mode) })
            }
            _ => Err(arity()),
        },
        "DUMP" if args.is_empty() => Ok(FunctionCommand::Dump),
        "RESTORE" => match args {
            [payload] => Ok(FunctionCommand::Restore {
                payload: get_bytes(payload)?,
                policy: RestorePolicy::default(),
            }),
            [payload, policy] => {
                let policy = match get_string(policy)?.to_uppercase().as_str() {
                    "APPEND" => RestorePolicy::Append,
                    "REPLACE" => RestorePolicy::Replace,
                    "FLUSH" => RestorePolicy::Flush,
                    _ => return Err(FunctionsError::Syntax),
                };
                Ok(FunctionCommand::Restore {
                    payload: get_bytes(payload)?,
                    policy,
                })
            }
            _ => Err(arity()),
        },
        "KILL" if args.is_empty() => Ok(FunctionCommand::Kill),
        "HELP" if args.is_empty() => Ok(FunctionCommand::Help),
        "STATS" | "DUMP" | "KILL" | "HELP" => Err(arity()),
        _ => Err(FunctionsError::UnknownSubcommand(subcommand.clone())),
    }
}

fn parse_list(args: &[Frame]) -> Result<FunctionCommand> {
    let mut library_pattern = None;
    let mut with_code = false;

    let mut i = 0;
    while i < args.len() {
        let option = get_string(&args[i])?.to_uppercase();
        match option.as_str() {
            "WITHCODE" if !with_code => {
                with_code = true;
                i += 1;
            }
            "LIBRARYNAME" if library_pattern.is_none() && i + 1 < args.len() => {
                library_pattern = Some(get_string(&args[i + 1])?);
                i += 2;
            }
            _ => return Err(FunctionsError::Syntax),
        }
    }

    Ok(FunctionCommand::List {
        library_pattern,
        with_code,
    })
}
