//! RESP reply frames
//!
//! The subset of RESP2/RESP3 values the FUNCTION / FCALL surface replies with.

use bytes::Bytes;

/// RESP protocol frame types
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(Bytes),

    /// Error: -ERR message\r\n
    Error(Bytes),

    /// Integer: :1000\r\n
    Integer(i64),

    /// Bulk string: $5\r\nhello\r\n or $-1\r\n for null
    Bulk(Option<Bytes>),

    /// Array: *2\r\n... or *-1\r\n for null
    Array(Option<Vec<Frame>>),

    /// Null: _\r\n (RESP3 explicit null)
    Null,
}

impl Frame {
    /// Create a simple string frame
    #[inline]
    pub fn simple(s: impl Into<Bytes>) -> Self {
        Frame::Simple(s.into())
    }

    /// Create an error frame
    #[cold]
    #[inline]
    pub fn error(s: impl Into<Bytes>) -> Self {
        Frame::Error(s.into())
    }

    /// The `+OK` reply
    #[inline]
    pub fn ok() -> Self {
        Frame::Simple(Bytes::from_static(b"OK"))
    }

    /// Create an integer frame
    #[inline]
    pub fn integer(n: i64) -> Self {
        Frame::Integer(n)
    }

    /// Create a bulk string frame
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    /// Create a null bulk string frame
    #[inline]
    pub fn null() -> Self {
        Frame::Bulk(None)
    }

    /// Create an array frame
    #[inline]
    pub fn array(frames: Vec<Frame>) -> Self {
        Frame::Array(Some(frames))
    }

    /// Create a flattened map reply (`key1 value1 key2 value2 ...`).
    ///
    /// Field order is preserved, which keeps LIST/STATS output stable.
    pub fn pairs(fields: Vec<(&'static str, Frame)>) -> Self {
        let mut frames = Vec::with_capacity(fields.len() * 2);
        for (key, value) in fields {
            frames.push(Frame::bulk(Bytes::from_static(key.as_bytes())));
            frames.push(value);
        }
        Frame::Array(Some(frames))
    }

    /// Check if this frame is null (bulk, array, or RESP3 Null)
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Bulk(None) | Frame::Array(None) | Frame::Null)
    }

    /// Check if this frame is an error
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Get the string value if this is a Simple, Error or Bulk frame
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(b) | Frame::Error(b) | Frame::Bulk(Some(b)) => {
                std::str::from_utf8(b).ok()
            }
            _ => None,
        }
    }

    /// Get the bytes if this is a Bulk frame
    #[inline]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Frame::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Get the integer value if this is an Integer frame
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the array if this is an Array frame
    pub fn as_array(&self) -> Option<&Vec<Frame>> {
        match self {
            Frame::Array(Some(arr)) => Some(arr),
            _ => None,
        }
    }

    /// Look up `key` in a flattened map reply built by [`Frame::pairs`]
    pub fn field(&self, key: &str) -> Option<&Frame> {
        self.as_array()?
            .chunks_exact(2)
            .find(|pair| pair[0].as_str() == Some(key))
            .map(|pair| &pair[1])
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Frame::bulk(s)
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for Frame {
    fn from(n: i64) -> Self {
        Frame::integer(n)
    }
}

impl From<Bytes> for Frame {
    fn from(b: Bytes) -> Self {
        Frame::bulk(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors() {
        assert_eq!(Frame::simple("OK"), Frame::Simple(Bytes::from("OK")));
        assert_eq!(Frame::ok(), Frame::simple("OK"));
        assert_eq!(Frame::error("ERR"), Frame::Error(Bytes::from("ERR")));
        assert_eq!(Frame::bulk("hello"), Frame::Bulk(Some(Bytes::from("hello"))));
        assert_eq!(Frame::null(), Frame::Bulk(None));
    }

    #[test]
    fn test_frame_is_null() {
        assert!(Frame::null().is_null());
        assert!(Frame::Null.is_null());
        assert!(!Frame::simple("OK").is_null());
    }

    #[test]
    fn test_pairs_and_field_lookup() {
        let frame = Frame::pairs(vec![
            ("library_name", Frame::bulk("mylib")),
            ("engine", Frame::bulk("LUA")),
        ]);
        assert_eq!(frame.as_array().map(Vec::len), Some(4));
        assert_eq!(frame.field("engine").and_then(Frame::as_str), Some("LUA"));
        assert!(frame.field("missing").is_none());
    }

    #[test]
    fn test_frame_conversions() {
        let frame: Frame = "hello".into();
        assert_eq!(frame.as_str(), Some("hello"));

        let frame: Frame = 42i64.into();
        assert_eq!(frame.as_integer(), Some(42));
    }
}
