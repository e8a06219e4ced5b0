//! Streaming RESP Parser
//!
//! Turns any byte stream into a lazy sequence of parsed values. A producer
//! task owns the reader and pushes one [`Payload`] per protocol unit into a
//! small bounded channel; the consumer drains the channel at its own pace,
//! which gives natural backpressure on fast clients.
//!
//! ## Error discipline
//!
//! Two kinds of failure are kept apart:
//!
//! - **Recoverable protocol errors** (a malformed number, a stray prefix):
//!   an error payload is emitted and parsing continues with the next line.
//! - **Stream-ending errors** (I/O failure, EOF): one final error payload is
//!   emitted and the channel closes.
//!
//! The consumer can tell them apart with [`ParseError::is_disconnect`].

use std::io::Cursor;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;

use crate::protocol::Reply;

/// Maximum size of a single bulk string (512 MB, the Redis limit).
pub const MAX_BULK_SIZE: i64 = 512 * 1024 * 1024;

/// Maximum element count of a multi-bulk request (the Redis limit).
pub const MAX_MULTI_BULK_LEN: i64 = 1024 * 1024;

/// One parsed protocol unit, or the reason parsing stopped.
pub type Payload = Result<Reply, ParseError>;

/// Errors produced by the parser.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The peer closed the stream (possibly mid-message).
    #[error("connection closed")]
    Eof,

    /// Malformed RESP; the stream itself is still readable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying reader failed.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// True when the error means the peer is gone and the connection should
    /// be torn down quietly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ParseError::Eof => true,
            ParseError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            ParseError::Protocol(_) => false,
        }
    }
}

/// Spawns a producer task over `reader` and returns the payload stream.
///
/// The stream yields parsed values in arrival order and is terminated by a
/// single stream-ending error payload, after which the channel closes.
pub fn parse_stream<R>(reader: R) -> mpsc::Receiver<Payload>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        parse_loop(reader, tx).await;
    });
    rx
}

/// Parses every value in `data`. Fails on the first malformed unit.
pub async fn parse_bytes(data: impl Into<Vec<u8>>) -> Result<Vec<Reply>, ParseError> {
    let mut stream = parse_stream(Cursor::new(data.into()));
    let mut replies = Vec::new();
    while let Some(payload) = stream.recv().await {
        match payload {
            Ok(reply) => replies.push(reply),
            Err(ParseError::Eof) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(replies)
}

/// Parses exactly one value from `data`.
pub async fn parse_one(data: impl Into<Vec<u8>>) -> Result<Reply, ParseError> {
    let mut stream = parse_stream(Cursor::new(data.into()));
    match stream.recv().await {
        Some(payload) => payload,
        None => Err(ParseError::Eof),
    }
}

async fn parse_loop<R>(reader: R, tx: mpsc::Sender<Payload>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Err(err) => {
                let _ = tx.send(Err(err.into())).await;
                return;
            }
            Ok(0) => {
                let _ = tx.send(Err(ParseError::Eof)).await;
                return;
            }
            Ok(_) => {}
        }
        if !line.ends_with(b"\n") {
            // Data without a terminator means the peer died mid-line.
            let _ = tx.send(Err(ParseError::Eof)).await;
            return;
        }
        trim_crlf(&mut line);
        if line.is_empty() {
            continue;
        }

        let payload = match line[0] {
            b'+' => Ok(Reply::Status(lossy(&line[1..]))),
            b'-' => Ok(Reply::Error(lossy(&line[1..]))),
            b':' => match parse_int(&line[1..]) {
                Ok(value) => Ok(Reply::Integer(value)),
                Err(_) => Err(ParseError::Protocol(format!("illegal number {}", lossy(&line[1..])))),
            },
            b'$' => match read_bulk_body(&mut reader, &line).await {
                Ok(payload) => payload,
                Err(end) => {
                    let _ = tx.send(Err(end)).await;
                    return;
                }
            },
            b'*' => match read_multi_bulk(&mut reader, &line).await {
                Ok(payload) => payload,
                Err(end) => {
                    let _ = tx.send(Err(end)).await;
                    return;
                }
            },
            // Inline command: whitespace-split the raw line.
            _ => {
                let args: Vec<Bytes> = line
                    .split(|byte| byte.is_ascii_whitespace())
                    .filter(|part| !part.is_empty())
                    .map(Bytes::copy_from_slice)
                    .collect();
                if args.is_empty() {
                    continue;
                }
                Ok(Reply::MultiBulk(args))
            }
        };

        if tx.send(payload).await.is_err() {
            // Consumer hung up; nothing left to parse for.
            return;
        }
    }
}

/// Reads the body of `$<len>\r\n...`. The outer `Err` ends the stream.
async fn read_bulk_body<R>(
    reader: &mut BufReader<R>,
    header: &[u8],
) -> Result<Payload, ParseError>
where
    R: AsyncRead + Unpin,
{
    let len = match parse_int(&header[1..]) {
        Ok(len) if (-1..=MAX_BULK_SIZE).contains(&len) => len,
        _ => {
            return Ok(Err(ParseError::Protocol(format!(
                "illegal bulk string header {}",
                lossy(header)
            ))))
        }
    };
    if len == -1 {
        return Ok(Ok(Reply::Null));
    }
    let body = read_exact_with_crlf(reader, len as usize).await?;
    Ok(Ok(Reply::Bulk(body)))
}

/// Reads `*<n>\r\n` followed by `n` bulk strings.
async fn read_multi_bulk<R>(
    reader: &mut BufReader<R>,
    header: &[u8],
) -> Result<Payload, ParseError>
where
    R: AsyncRead + Unpin,
{
    let count = match parse_int(&header[1..]) {
        Ok(count) if (-1..=MAX_MULTI_BULK_LEN).contains(&count) => count,
        _ => {
            return Ok(Err(ParseError::Protocol(format!(
                "illegal array header {}",
                lossy(header)
            ))))
        }
    };
    if count == -1 {
        return Ok(Ok(Reply::NullArray));
    }

    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Err(err) => return Err(err.into()),
            Ok(0) => return Err(ParseError::Eof),
            Ok(_) => {}
        }
        if !line.ends_with(b"\n") {
            return Err(ParseError::Eof);
        }
        trim_crlf(&mut line);
        if line.first() != Some(&b'$') {
            return Ok(Err(ParseError::Protocol(format!(
                "illegal bulk string header {}",
                lossy(&line)
            ))));
        }
        let len = match parse_int(&line[1..]) {
            Ok(len) if (-1..=MAX_BULK_SIZE).contains(&len) => len,
            _ => {
                return Ok(Err(ParseError::Protocol(format!(
                    "illegal bulk string length {}",
                    lossy(&line[1..])
                ))))
            }
        };
        if len == -1 {
            // A null element inside a command array; carried as empty.
            args.push(Bytes::new());
            continue;
        }
        args.push(read_exact_with_crlf(reader, len as usize).await?);
    }
    Ok(Ok(Reply::MultiBulk(args)))
}

/// Reads exactly `len` payload bytes plus the trailing CRLF.
async fn read_exact_with_crlf<R>(
    reader: &mut BufReader<R>,
    len: usize,
) -> Result<Bytes, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; len + 2];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ParseError::Eof,
            _ => ParseError::Io(err),
        })?;
    body.truncate(len);
    Ok(Bytes::from(body))
}

fn trim_crlf(line: &mut Vec<u8>) {
    if line.ends_with(b"\n") {
        line.pop();
    }
    if line.ends_with(b"\r") {
        line.pop();
    }
}

fn parse_int(digits: &[u8]) -> Result<i64, ()> {
    std::str::from_utf8(digits)
        .map_err(|_| ())?
        .parse::<i64>()
        .map_err(|_| ())
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
