//! RESP Reply Taxonomy
//!
//! In-memory representations of everything the server can say back to a
//! client, each knowing how to marshal itself to RESP bytes. The reserved
//! replies (`+OK`, `+PONG`, `+QUEUED`, `*-1`) and the standard error family
//! (`ERR`, `WRONGTYPE`, `EXECABORT`) are exposed as constructors so call
//! sites never spell protocol strings by hand.

use bytes::Bytes;
use std::fmt;

/// The CRLF line terminator of the RESP protocol.
pub const CRLF: &[u8] = b"\r\n";

/// A value ready to be serialized onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<status>\r\n`. Non-binary-safe one-liners such as `OK`.
    Status(String),

    /// `-<message>\r\n`. The stored message carries no `-` or CRLF framing.
    Error(String),

    /// `:<int>\r\n`.
    Integer(i64),

    /// `$<len>\r\n<bytes>\r\n`. Binary safe.
    Bulk(Bytes),

    /// `$-1\r\n`, the null bulk string.
    Null,

    /// `*<n>\r\n` followed by `n` bulk strings. An empty vector is `*0\r\n`.
    MultiBulk(Vec<Bytes>),

    /// `*-1\r\n`, the null array. EXEC answers this on a watch miss.
    NullArray,

    /// `*<n>\r\n` followed by `n` arbitrary replies (EXEC results,
    /// COMMAND descriptions).
    Raw(Vec<Reply>),

    /// Several top-level replies concatenated without an array header,
    /// e.g. the per-channel frames of SUBSCRIBE. Never parsed, only written.
    Batch(Vec<Reply>),
}

impl Reply {
    /// `+OK\r\n`
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// `+PONG\r\n`
    pub fn pong() -> Self {
        Reply::Status("PONG".to_string())
    }

    /// `+QUEUED\r\n`, answered to commands buffered inside MULTI.
    pub fn queued() -> Self {
        Reply::Status("QUEUED".to_string())
    }

    pub fn status(s: impl Into<String>) -> Self {
        Reply::Status(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Reply::Integer(n)
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// `*0\r\n`
    pub fn empty_multi_bulk() -> Self {
        Reply::MultiBulk(Vec::new())
    }

    /// `-ERR unknown command '<name>'`
    pub fn unknown_command_err(name: &str) -> Self {
        Reply::Error(format!("ERR unknown command '{}'", name))
    }

    /// `-ERR wrong number of arguments for '<cmd>' command`
    pub fn arg_num_err(cmd: &str) -> Self {
        Reply::Error(format!("ERR wrong number of arguments for '{}' command", cmd))
    }

    /// `-ERR syntax error`
    pub fn syntax_err() -> Self {
        Reply::Error("ERR syntax error".to_string())
    }

    /// `-WRONGTYPE Operation against a key holding the wrong kind of value`
    pub fn wrong_type_err() -> Self {
        Reply::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
    }

    /// `-ERR Protocol error: <msg>`
    pub fn protocol_err(msg: &str) -> Self {
        Reply::Error(format!("ERR Protocol error: {}", msg))
    }

    /// `-ERR unknown`, the catch-all answer after an executor panic.
    pub fn unknown_err() -> Self {
        Reply::Error("ERR unknown".to_string())
    }

    /// `-EXECABORT Transaction discarded because of previous errors.`
    pub fn exec_abort_err() -> Self {
        Reply::Error("EXECABORT Transaction discarded because of previous errors.".to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s == "OK")
    }

    /// Serializes to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_into(&mut buf);
        buf
    }

    /// Serializes into an existing buffer, avoiding the extra allocation.
    pub fn write_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Bulk(data) => write_bulk(buf, data),
            Reply::Null => buf.extend_from_slice(b"$-1\r\n"),
            Reply::MultiBulk(args) => {
                buf.push(b'*');
                buf.extend_from_slice(args.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for arg in args {
                    write_bulk(buf, arg);
                }
            }
            Reply::NullArray => buf.extend_from_slice(b"*-1\r\n"),
            Reply::Raw(replies) => {
                buf.push(b'*');
                buf.extend_from_slice(replies.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for reply in replies {
                    reply.write_into(buf);
                }
            }
            Reply::Batch(replies) => {
                for reply in replies {
                    reply.write_into(buf);
                }
            }
        }
    }
}

fn write_bulk(buf: &mut Vec<u8>, data: &Bytes) {
    buf.push(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "{}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Reply::Null => write!(f, "(nil)"),
            Reply::NullArray => write!(f, "(nil array)"),
            Reply::MultiBulk(args) => {
                write!(f, "[")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\"", String::from_utf8_lossy(arg))?;
                }
                write!(f, "]")
            }
            Reply::Raw(replies) | Reply::Batch(replies) => {
                write!(f, "[")?;
                for (i, reply) in replies.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", reply)?;
                }
                write!(f, "]")
            }
        }
    }
}
