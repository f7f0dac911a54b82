//! Execution of parsed commands against a [`FunctionsRegistry`]
//!
//! Errors are rendered as RESP error replies; nothing here fails.

use bytes::Bytes;

use crate::functions::{CallMode, EngineStats, FunctionInfo, FunctionsRegistry, LibraryInfo};
use crate::protocol::Frame;

use super::parser::{parse_command, Command, FunctionCommand};

const FUNCTION_HELP: &[&str] = &[
    "FUNCTION <subcommand> [<arg> [value] [opt] ...]. Subcommands are:",
    "LOAD [REPLACE] <LIBRARY CODE>",
    "    Create a new library with the given library name and code.",
    "DELETE <LIBRARY NAME>",
    "    Delete the given library.",
    "LIST [LIBRARYNAME PATTERN] [WITHCODE]",
    "    Return general information on all the libraries:",
    "    * Library name",
    "    * The engine used to run the Library",
    "    * Set of functions of the library",
    "    * Library code (if WITHCODE is given)",
    "    It also possible to get only function that matches a pattern using LIBRARYNAME argument.",
    "STATS",
    "    Return information about the current function running:",
    "    * Function name",
    "    * Command used to run the function",
    "    * Duration in MS that the function is running",
    "    If no function is running, return nil",
    "    In addition, returns a list of available engines.",
    "KILL",
    "    Kill the current running function.",
    "FLUSH [ASYNC|SYNC]",
    "    Delete all the libraries.",
    "    When called with no argument the configured lazyfree mode is used.",
    "DUMP",
    "    Return a serialized payload representing the current libraries, can be restored using FUNCTION RESTORE command",
    "RESTORE <PAYLOAD> [FLUSH|APPEND|REPLACE]",
    "    Restore the libraries represented by the given payload, it is possible to give a restore policy to",
    "    control how to handle existing libraries (default APPEND):",
    "    * FLUSH: delete all existing libraries.",
    "    * APPEND: appends the restored libraries to the existing libraries. On collision, skip.",
    "    * REPLACE: appends the restored libraries to the existing libraries, On collision, replace the old",
    "      libraries with the new libraries.",
    "HELP",
    "    Print this help.",
];

/// Parse and execute one request
pub fn execute_frames(registry: &FunctionsRegistry, frames: &[Frame]) -> Frame {
    match parse_command(frames) {
        Ok(command) => execute(registry, command),
        Err(e) => Frame::error(e.to_resp_error()),
    }
}

/// Execute a parsed command
pub fn execute(registry: &FunctionsRegistry, command: Command) -> Frame {
    match command {
        Command::Function(sub) => function(registry, sub),
        Command::FCall {
            function,
            numkeys,
            args,
            read_only,
        } => {
            let mode = if read_only {
                CallMode::ReadOnly
            } else {
                CallMode::Write
            };
            registry
                .call(&function, numkeys, &args, mode)
                .unwrap_or_else(|e| Frame::error(e.to_resp_error()))
        }
    }
}

fn function(registry: &FunctionsRegistry, command: FunctionCommand) -> Frame {
    let result = match command {
        FunctionCommand::Load { replace, code } => registry
            .load(&code, replace)
            .map(|name| Frame::bulk(Bytes::from(name))),
        FunctionCommand::List {
            library_pattern,
            with_code,
        } => {
            let libraries = registry.list(library_pattern.as_deref(), with_code);
            Ok(Frame::array(libraries.into_iter().map(library_frame).collect()))
        }
        FunctionCommand::Stats => Ok(stats_frame(registry.stats())),
        FunctionCommand::Delete { library } => registry.delete(&library).map(|()| Frame::ok()),
        FunctionCommand::Flush { mode } => {
            registry.flush(mode);
            Ok(Frame::ok())
        }
        FunctionCommand::Dump => Ok(Frame::bulk(registry.dump())),
        FunctionCommand::Restore { payload, policy } => registry
            .restore(&payload, policy)
            .map(|restored| Frame::Integer(restored as i64)),
        FunctionCommand::Kill => registry.kill().map(|()| Frame::ok()),
        FunctionCommand::Help => Ok(Frame::array(
            FUNCTION_HELP
                .iter()
                .map(|line| Frame::simple(*line))
                .collect(),
        )),
    };

    result.unwrap_or_else(|e| Frame::error(e.to_resp_error()))
}

fn library_frame(library: LibraryInfo) -> Frame {
    let mut fields = vec![
        ("library_name", Frame::bulk(Bytes::from(library.name))),
        ("engine", Frame::bulk(Bytes::from(library.engine))),
        (
            "functions",
            Frame::array(library.functions.into_iter().map(function_frame).collect()),
        ),
    ];
    if let Some(code) = library.code {
        fields.push(("library_code", Frame::bulk(Bytes::from(code))));
    }
    Frame::pairs(fields)
}

fn function_frame(function: FunctionInfo) -> Frame {
    let flags = function
        .flags
        .names()
        .into_iter()
        .map(Frame::simple)
        .collect();
    Frame::pairs(vec![
        ("name", Frame::bulk(Bytes::from(function.name))),
        (
            "description",
            function
                .description
                .map_or_else(Frame::null, |d| Frame::bulk(Bytes::from(d))),
        ),
        ("flags", Frame::array(flags)),
    ])
}

fn stats_frame(engines: Vec<(String, EngineStats)>) -> Frame {
    let mut engine_frames = Vec::with_capacity(engines.len() * 2);
    for (name, stats) in engines {
        engine_frames.push(Frame::bulk(Bytes::from(name)));
        engine_frames.push(Frame::pairs(vec![
            ("libraries_count", Frame::Integer(stats.library_count as i64)),
            ("functions_count", Frame::Integer(stats.function_count as i64)),
        ]));
    }
    Frame::pairs(vec![
        ("running_script", Frame::null()),
        ("engines", Frame::array(engine_frames)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionFlags;

    fn run(registry: &FunctionsRegistry, args: &[&str]) -> Frame {
        let frames: Vec<Frame> = args.iter().map(|a| Frame::bulk(a.to_string())).collect();
        execute_frames(registry, &frames)
    }

    #[test]
    fn test_help_and_kill() {
        let registry = FunctionsRegistry::new();
        let help = run(&registry, &["FUNCTION", "HELP"]);
        assert!(help.as_array().is_some_and(|lines| lines.len() == FUNCTION_HELP.len()));

        let kill = run(&registry, &["FUNCTION", "KILL"]);
        assert_eq!(
            kill,
            Frame::error("NOTBUSY No scripts in execution right now.")
        );
    }

    #[test]
    fn test_errors_become_replies() {
        let registry = FunctionsRegistry::new();
        assert_eq!(
            run(&registry, &["FUNCTION", "DELETE", "nope"]),
            Frame::error("ERR Library not found")
        );
        assert_eq!(
            run(&registry, &["FCALL", "nope", "0"]),
            Frame::error("ERR Function not found")
        );
        assert_eq!(
            run(&registry, &["FCALL", "nope", "-1"]),
            Frame::error("ERR Number of keys can't be negative")
        );
        assert!(run(&registry, &["FUNCTION", "LOAD", "no header"]).is_error());
    }

    #[test]
    fn test_stats_frame_layout() {
        let frame = stats_frame(vec![(
            "LUA".to_string(),
            EngineStats {
                library_count: 1,
                function_count: 3,
            },
        )]);
        assert!(frame.field("running_script").is_some_and(Frame::is_null));

        let engines = frame.field("engines").and_then(Frame::as_array).unwrap();
        assert_eq!(engines[0].as_str(), Some("LUA"));
        assert_eq!(
            engines[1].field("functions_count").and_then(Frame::as_integer),
            Some(3)
        );
    }

    #[test]
    fn test_library_frame_layout() {
        let frame = library_frame(LibraryInfo {
            name: "lib".to_string(),
            engine: "LUA".to_string(),
            functions: vec![FunctionInfo {
                name: "f".to_string(),
                description: None,
                flags: FunctionFlags::NO_WRITES,
            }],
            code: Some("#!lua name=lib\n".to_string()),
        });

        assert_eq!(frame.field("library_name").and_then(Frame::as_str), Some("lib"));
        assert_eq!(
            frame.field("library_code").and_then(Frame::as_str),
            Some("#!lua name=lib\n")
        );
        let functions = frame.field("functions").and_then(Frame::as_array).unwrap();
        assert!(functions[0].field("description").is_some_and(Frame::is_null));
        assert_eq!(
            functions[0].field("flags"),
            Some(&Frame::array(vec![Frame::simple("no-writes")]))
        );
    }
}
