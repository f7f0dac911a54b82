//! FUNCTION DUMP payload format
//!
//! ```text
//! "FUNCS" <version u8>
//! ( 0x01 <engine> <library> <code> )*
//! 0xFF <crc64 u64 LE over everything before it>
//! ```
//!
//! Strings are length-prefixed using the RDB length encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FunctionsError, Result};

const DUMP_MAGIC: &[u8] = b"FUNCS";
const DUMP_VERSION: u8 = 1;

const OPCODE_LIBRARY: u8 = 0x01;
const OPCODE_EOF: u8 = 0xFF;

const CHECKSUM_LEN: usize = 8;

/// One library as stored in a dump payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRecord {
    /// Engine name
    pub engine: String,
    /// Library name
    pub name: String,
    /// Full library source
    pub code: String,
}

/// Builds a dump payload
pub struct DumpWriter {
    buffer: BytesMut,
}

impl DumpWriter {
    /// Create a writer with the header already written
    pub fn new() -> Self {
        let mut buffer = BytesMut::with_capacity(1024);
        buffer.extend_from_slice(DUMP_MAGIC);
        buffer.put_u8(DUMP_VERSION);
        Self { buffer }
    }

    /// Append one library record
    pub fn write_library(&mut self, engine: &str, name: &str, code: &str) {
        self.buffer.put_u8(OPCODE_LIBRARY);
        self.write_string(engine.as_bytes());
        self.write_string(name.as_bytes());
        self.write_string(code.as_bytes());
    }

    /// Write the EOF marker and checksum
    pub fn finish(mut self) -> Bytes {
        self.buffer.put_u8(OPCODE_EOF);
        let checksum = crc64(&self.buffer);
        self.buffer.put_u64_le(checksum);
        self.buffer.freeze()
    }

    fn write_length(&mut self, len: u64) {
        if len < 64 {
            // 00xxxxxx
            self.buffer.put_u8(len as u8);
        } else if len < 16384 {
            // 01xxxxxx xxxxxxxx
            self.buffer.put_u8(0x40 | ((len >> 8) as u8 & 0x3F));
            self.buffer.put_u8((len & 0xFF) as u8);
        } else if len < (1 << 32) {
            self.buffer.put_u8(0x80);
            self.buffer.put_u32(len as u32);
        } else {
            self.buffer.put_u8(0x81);
            self.buffer.put_u64(len);
        }
    }

    fn write_string(&mut self, s: &[u8]) {
        self.write_length(s.len() as u64);
        self.buffer.extend_from_slice(s);
    }
}

impl Default for DumpWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cold]
fn bad_checksum() -> FunctionsError {
    FunctionsError::PayloadMalformed("payload version or checksum are wrong".to_string())
}

#[cold]
fn bad_payload() -> FunctionsError {
    FunctionsError::PayloadMalformed(
        "given payload is not a valid function payload".to_string(),
    )
}

/// Validate a dump payload and return its records in order
pub fn decode(payload: &[u8]) -> Result<Vec<DumpRecord>> {
    let header_len = DUMP_MAGIC.len() + 1;
    if payload.len() < header_len + 1 + CHECKSUM_LEN {
        return Err(bad_checksum());
    }
    let (magic, rest) = payload.split_at(DUMP_MAGIC.len());
    if magic != DUMP_MAGIC || rest[0] != DUMP_VERSION {
        return Err(bad_checksum());
    }

    let (body, mut trailer) = payload.split_at(payload.len() - CHECKSUM_LEN);
    if trailer.get_u64_le() != crc64(body) {
        return Err(bad_checksum());
    }

    let mut reader = DumpReader {
        buf: &body[header_len..],
    };
    let mut records = Vec::new();
    loop {
        match reader.read_u8()? {
            OPCODE_EOF => break,
            OPCODE_LIBRARY => records.push(DumpRecord {
                engine: reader.read_string()?,
                name: reader.read_string()?,
                code: reader.read_string()?,
            }),
            _ => return Err(bad_payload()),
        }
    }

    if reader.buf.has_remaining() {
        return Err(bad_payload());
    }
    Ok(records)
}

struct DumpReader<'a> {
    buf: &'a [u8],
}

impl DumpReader<'_> {
    fn read_u8(&mut self) -> Result<u8> {
        if !self.buf.has_remaining() {
            return Err(bad_payload());
        }
        Ok(self.buf.get_u8())
    }

    fn read_length(&mut self) -> Result<u64> {
        let first = self.read_u8()?;
        match first >> 6 {
            0 => Ok((first & 0x3F) as u64),
            1 => {
                let second = self.read_u8()?;
                Ok((((first & 0x3F) as u64) << 8) | second as u64)
            }
            2 if first == 0x80 && self.buf.remaining() >= 4 => Ok(self.buf.get_u32() as u64),
            2 if first == 0x81 && self.buf.remaining() >= 8 => Ok(self.buf.get_u64()),
            _ => Err(bad_payload()),
        }
    }

    fn read_string(&mut self) -> Result<String> {
        let len = usize::try_from(self.read_length()?).map_err(|_| bad_payload())?;
        if self.buf.remaining() < len {
            return Err(bad_payload());
        }
        let (s, rest) = self.buf.split_at(len);
        self.buf = rest;
        String::from_utf8(s.to_vec()).map_err(|_| bad_payload())
    }
}

/// CRC-64 with the reflected ECMA-182 polynomial
fn crc64(data: &[u8]) -> u64 {
    const POLY: u64 = 0xC96C5795D7870F42;
    let mut crc: u64 = 0;

    for &byte in data {
        crc ^= byte as u64;
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}
