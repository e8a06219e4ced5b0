//! RESP Protocol Implementation
//!
//! Everything about the wire format lives here: the in-memory reply
//! taxonomy with its RESP serialization, and the streaming parser that
//! turns a byte stream into a sequence of parsed values.
//!
//! ## Wire format
//!
//! Each RESP value starts with a type prefix byte and ends with CRLF:
//!
//! - `+OK\r\n` status
//! - `-ERR unknown command\r\n` error
//! - `:1000\r\n` integer
//! - `$5\r\nhello\r\n` bulk string (`$-1\r\n` is null)
//! - `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n` array (`*-1\r\n` is null)
//!
//! A line without a known prefix is treated as an inline command and split
//! on whitespace.

pub mod parser;
pub mod reply;

pub use parser::{parse_bytes, parse_one, parse_stream, ParseError, Payload};
pub use reply::Reply;

use bytes::Bytes;

/// A full command line: name followed by arguments, all binary-safe.
pub type CmdLine = Vec<Bytes>;

/// Builds a [`CmdLine`] from string parts.
pub fn cmd_line(parts: &[&str]) -> CmdLine {
    parts
        .iter()
        .map(|part| Bytes::copy_from_slice(part.as_bytes()))
        .collect()
}
