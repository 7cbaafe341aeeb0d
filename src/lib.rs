//! Core protocol engine of an AMQP 0-9-1 client.
//!
//! This crate implements the connection-level state machine, the binary
//! frame codec, the channel multiplexer, and the heartbeat subsystem
//! needed to open a connection to an AMQP 0-9-1 broker, keep it alive,
//! multiplex logical channels over the single underlying stream, and
//! shut it down cleanly. Channel-level method semantics (publish,
//! consume, queue/exchange declaration, acknowledgements) are left to a
//! layer built on top: this crate only routes frames to a channel handle
//! and exposes a frame-send path.
//!
//! # Quick start
//!
//! ```no_run
//! use amqp_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = ConnectionBuilder::new()
//!         .login("guest")
//!         .password("guest")
//!         .virtual_host("/")
//!         .heartbeat(60)
//!         .connect("localhost", 5672)
//!         .await?;
//!
//!     let mut channel = connection.new_channel().await?;
//!     println!("opened channel {}", channel.id());
//!
//!     connection.close(false, None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`codec`]: the frame envelope and typed field primitives.
//! - [`method`]: `Connection`/`Channel` class method encoding/decoding.
//! - [`transport`]: the write serializer and the buffering frame reader.
//! - [`heartbeat`]: the sender and receiver-watchdog tasks.
//! - [`channel`]: channel id allocation and frame routing.
//! - [`dispatcher`]: the long-lived receive loop.
//! - [`connection`]: the handshake, configuration, and the public handle.
//! - [`state`]: the connection lifecycle states shared across all of the above.
//! - [`error`]: the error taxonomy.

pub mod channel;
pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod method;
pub mod state;
pub mod transport;

pub use channel::{Channel, ChannelEvent};
pub use connection::{Connection, ConnectionBuilder, ConnectionConfig, ErrorHook};
pub use error::{AmqpError, AmqpResult};
pub use state::ConnectionState;

/// Re-exports of the types most callers need.
pub mod prelude {
    pub use crate::{
        AmqpError, AmqpResult, Channel, ChannelEvent, Connection, ConnectionBuilder,
        ConnectionConfig, ConnectionState,
    };
}
