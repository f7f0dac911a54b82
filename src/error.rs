//! Error types for Ferrite functions
//!
//! Every failure of the FUNCTION / FCALL surface is a local, synchronous user
//! error. None of them leave the live functions context partially mutated.
//! Uses `thiserror` for ergonomic error definitions.

use thiserror::Error;

/// Main error type for the functions subsystem
#[derive(Error, Debug)]
pub enum FunctionsError {
    /// Function or library name contains characters outside `[A-Za-z0-9_]`
    #[error("{0} names can only contain letters, numbers, or underscores(_) and must be at least one character long")]
    InvalidName(&'static str),

    /// No engine registered under the given name
    #[error("Engine '{0}' not found")]
    EngineNotFound(String),

    /// An engine with the same (case-insensitive) name already exists
    #[error("Engine '{0}' already registered")]
    EngineAlreadyRegistered(String),

    /// Engine still owns loaded libraries
    #[error("Engine '{0}' still has libraries loaded")]
    EngineInUse(String),

    /// Library already loaded and REPLACE was not given
    #[error("Library '{0}' already exists")]
    LibraryExists(String),

    /// Library is not loaded
    #[error("Library not found")]
    LibraryNotFound(String),

    /// Function name already registered
    #[error("Function {0} already exists")]
    FunctionExists(String),

    /// Function is not registered
    #[error("Function not found")]
    FunctionNotFound(String),

    /// Engine rejected the library source
    #[error("Error compiling function: {0}")]
    CompileError(String),

    /// Engine failed while running a function
    #[error("Error running function: {0}")]
    ExecutionError(String),

    /// FCALL_RO on a function without the `no-writes` flag
    #[error("Can not execute a script with write flag using *_ro command.")]
    WriteOnReadOnlyCall,

    /// numkeys negative or larger than the number of trailing arguments
    #[error("{0}")]
    ArgumentCountError(&'static str),

    /// Library metadata header or DUMP payload could not be parsed
    #[error("{0}")]
    PayloadMalformed(String),

    /// Resolved function whose library or engine linkage is inconsistent
    #[error("Function library is invalid")]
    InvalidFunctionReference(String),

    /// FUNCTION KILL with nothing running
    #[error("No scripts in execution right now.")]
    NotBusy,

    /// Wrong number of arguments for a command
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// Command syntax error
    #[error("syntax error")]
    Syntax,

    /// Command name is not part of the functions surface
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Unknown FUNCTION subcommand
    #[error("unknown subcommand '{0}'. Try FUNCTION HELP.")]
    UnknownSubcommand(String),

    /// Argument could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Value cannot be parsed as integer
    #[error("value is not an integer or out of range")]
    NotInteger,

    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for functions operations
pub type Result<T> = std::result::Result<T, FunctionsError>;

impl FunctionsError {
    /// Convert error to RESP error string
    #[cold]
    pub fn to_resp_error(&self) -> String {
        match self {
            FunctionsError::NotBusy => format!("NOTBUSY {self}"),
            FunctionsError::CompileError(_) | FunctionsError::ExecutionError(_) => {
                // Engine messages may span lines; RESP errors cannot.
                format!("ERR {}", self.to_string().replace(['\r', '\n'], " "))
            }
            _ => format!("ERR {self}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_to_resp() {
        assert_eq!(
            FunctionsError::LibraryExists("mylib".to_string()).to_resp_error(),
            "ERR Library 'mylib' already exists"
        );
        assert_eq!(
            FunctionsError::WrongArity("FCALL".to_string()).to_resp_error(),
            "ERR wrong number of arguments for 'FCALL' command"
        );
        assert_eq!(
            FunctionsError::NotBusy.to_resp_error(),
            "NOTBUSY No scripts in execution right now."
        );
    }

    #[test]
    fn test_engine_error_is_single_line() {
        let err = FunctionsError::CompileError("line 1\nline 2".to_string());
        let resp = err.to_resp_error();
        assert!(!resp.contains('\n'));
        assert!(resp.starts_with("ERR Error compiling function:"));
    }

    #[test]
    fn test_unknown_subcommand_message() {
        assert_eq!(
            FunctionsError::UnknownSubcommand("FOO".to_string()).to_resp_error(),
            "ERR unknown subcommand 'FOO'. Try FUNCTION HELP."
        );
    }

    #[test]
    fn test_invalid_name_message() {
        let err = FunctionsError::InvalidName("Function");
        assert!(err
            .to_string()
            .starts_with("Function names can only contain letters"));
    }
}
