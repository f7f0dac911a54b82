//! RESP reply values
//!
//! Replies produced by the command surface, plus the wire encoder used by the
//! CLI's `--resp` output mode.

mod encoder;
mod frame;

pub use encoder::{encode_frame, encode_to_bytes};
pub use frame::Frame;
