//! Library metadata header
//!
//! Library source starts with a single header line naming the engine and the
//! library, e.g. `#!lua name=mylib`.

use crate::error::{FunctionsError, Result};

use super::library::verify_name;

/// Parsed metadata header of a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryMetadata<'a> {
    /// Engine name as written (matched case-insensitively)
    pub engine: &'a str,
    /// Library name
    pub name: &'a str,
    /// Source following the header, starting at the header's line break so
    /// line numbers still match the submitted code
    pub body: &'a str,
}

fn malformed(msg: impl Into<String>) -> FunctionsError {
    FunctionsError::PayloadMalformed(msg.into())
}

/// Parse the `#!<engine> name=<library>` header of `code`.
pub fn parse(code: &str) -> Result<LibraryMetadata<'_>> {
    let rest = code
        .strip_prefix("#!")
        .ok_or_else(|| malformed("library code must start with shebang statement"))?;
    let eol = rest
        .find('\n')
        .ok_or_else(|| malformed("missing library metadata"))?;
    let (header, body) = rest.split_at(eol);

    let mut parts = header.trim_end_matches('\r').split_whitespace();
    let engine = parts
        .next()
        .ok_or_else(|| malformed("engine name must be specified in shebang"))?;

    let mut name = None;
    for field in parts {
        match field.split_once('=') {
            Some(("name", value)) => name = Some(value),
            _ => return Err(malformed(format!("Invalid metadata value given: {field}"))),
        }
    }

    let name = match name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(malformed("library name must be specified in shebang")),
    };
    if !verify_name(name) {
        return Err(FunctionsError::InvalidName("Library"));
    }

    Ok(LibraryMetadata { engine, name, body })
}
