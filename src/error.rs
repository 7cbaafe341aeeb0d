//! AMQP 0-9-1 Error Handling
//!
//! This module defines the error taxonomy for the connection core: codec
//! failures, protocol violations, and the various ways a connection or
//! channel allocation can fail.

use thiserror::Error;

/// Errors raised by the AMQP 0-9-1 protocol engine.
#[derive(Error, Debug)]
pub enum AmqpError {
    /// The connection has been closed, by either side; every further
    /// operation must fail with this.
    #[error("connection closed")]
    ClosedConnection,

    /// An operation was attempted before the opening handshake completed.
    #[error("connection isn't established yet")]
    NotEstablished,

    /// Channel allocation was refused because the server's `channel_max`
    /// limit has been reached and no id is free for reuse.
    #[error("no channel available")]
    NoChannelAvailable,

    /// A channel-level close, cascaded from a connection close.
    #[error("channel closed: {reply_code} {reply_text}")]
    ChannelClosed {
        reply_code: u16,
        reply_text: String,
    },

    /// The server sent an unexpected frame or method, or violated the
    /// handshake sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server closed the connection with code 403 during the opening
    /// handshake.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The receiver watchdog fired: no traffic was seen for `2 * heartbeat`
    /// seconds and the connection was force-closed.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// A frame's trailing `0xCE` marker was missing or the envelope was
    /// otherwise malformed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A field table contained a type tag this codec doesn't recognize.
    #[error("unsupported field type: {0:#04x}")]
    UnsupportedFieldType(u8),

    /// A `shortstr` would have exceeded the 255 octet length limit.
    #[error("string too long: {0} bytes")]
    StringTooLong(usize),

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for AMQP operations.
pub type AmqpResult<T> = Result<T, AmqpError>;
