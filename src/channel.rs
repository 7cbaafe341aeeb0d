//! Channel Multiplexer
//!
//! Allocates and recycles channel identifiers, owns the channel table, and
//! propagates connection-wide closure to every live channel. Channel-level
//! method semantics (publish, consume, declare, ack) are out of scope here:
//! the core only hands a channel object its inbound frames and a send
//! path, and the channel layer built on top interprets them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};

use crate::codec::{Frame, FrameType};
use crate::error::{AmqpError, AmqpResult};
use crate::method::{self, CLASS_CHANNEL, CHANNEL_OPEN_OK};
use crate::transport::WriteSerializer;

/// What a channel's task sees arrive: a routed frame, or notice that the
/// owning connection has gone away.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Frame(Frame),
    ConnectionClosed { reply_code: u16, reply_text: String },
}

/// The `u16 -> channel` mapping plus the bookkeeping needed to allocate
/// and recycle ids per spec: `ceil` is the high-water mark of ever
/// allocated ids, `free` holds returned ids eligible for immediate reuse.
pub struct ChannelTable {
    ids_ceil: u16,
    ids_free: BTreeSet<u16>,
    channels: HashMap<u16, mpsc::UnboundedSender<ChannelEvent>>,
    server_channel_max: u16,
}

impl ChannelTable {
    pub fn new(server_channel_max: u16) -> Self {
        ChannelTable {
            ids_ceil: 0,
            ids_free: BTreeSet::new(),
            channels: HashMap::new(),
            server_channel_max,
        }
    }

    pub fn set_server_channel_max(&mut self, max: u16) {
        self.server_channel_max = max;
    }

    /// The allocation algorithm from the channel multiplexer spec: reuse
    /// a freed id if one exists (lowest first, to keep ids dense),
    /// otherwise grow the ceiling if the server allows it, otherwise fail.
    pub fn allocate(&mut self) -> AmqpResult<u16> {
        if let Some(&id) = self.ids_free.iter().next() {
            self.ids_free.remove(&id);
            return Ok(id);
        }
        if self.server_channel_max == 0 || self.ids_ceil < self.server_channel_max {
            self.ids_ceil += 1;
            return Ok(self.ids_ceil);
        }
        Err(AmqpError::NoChannelAvailable)
    }

    pub fn insert(&mut self, id: u16, sender: mpsc::UnboundedSender<ChannelEvent>) {
        self.channels.insert(id, sender);
    }

    /// Returns `id` to the free pool; called once a channel's own close
    /// handshake has completed. The id is eligible for immediate reuse.
    pub fn release(&mut self, id: u16) {
        self.channels.remove(&id);
        self.ids_free.insert(id);
    }

    /// Routes a non-zero-channel frame to its channel, if still present.
    /// Returns `false` if the channel is unknown (the caller logs and
    /// drops rather than tearing down: channels may be closing
    /// asynchronously).
    pub fn route(&self, channel_id: u16, frame: Frame) -> bool {
        match self.channels.get(&channel_id) {
            Some(sender) => sender.send(ChannelEvent::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Iterates every live channel, tells it the connection closed, and
    /// clears the table. No further frames are routed after this point.
    pub fn cascade_close(&mut self, reply_code: u16, reply_text: &str) {
        for (_, sender) in self.channels.drain() {
            let _ = sender.send(ChannelEvent::ConnectionClosed {
                reply_code,
                reply_text: reply_text.to_string(),
            });
        }
    }

    pub fn live_count(&self) -> usize {
        self.ids_ceil as usize - self.ids_free.len()
    }

    pub fn routed_channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// A logical, independently flow-controlled subconnection multiplexed
/// over the connection's single transport.
pub struct Channel<W> {
    id: u16,
    writer: Arc<WriteSerializer<W>>,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    table: Arc<Mutex<ChannelTable>>,
}

impl<W: AsyncWrite + Unpin> Channel<W> {
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Sends a single frame on this channel.
    pub async fn send_frame(&self, frame_type: FrameType, payload: Vec<u8>) -> AmqpResult<()> {
        self.writer
            .write_frame(&Frame {
                frame_type,
                channel: self.id,
                payload,
            })
            .await
    }

    /// Sends a composed sequence of frames (e.g. method + header + body)
    /// atomically: no other writer's frames can land on the wire between
    /// them.
    pub async fn send_frames(&self, frames: Vec<Frame>) -> AmqpResult<()> {
        self.writer.write_frames(&frames).await
    }

    /// Awaits the next frame or connection-closed notice routed to this
    /// channel, in the order it arrived on the wire.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.inbound.recv().await
    }

    /// Called once this channel's own close handshake has completed;
    /// returns its id to the connection's free pool for immediate reuse.
    pub async fn release(self) {
        self.table.lock().await.release(self.id);
    }
}

/// Allocates a channel, opens it on the wire, and waits for
/// `Channel.Open-Ok`. Shared by `Connection::new_channel`.
pub(crate) async fn open_channel<W: AsyncWrite + Unpin>(
    table: Arc<Mutex<ChannelTable>>,
    writer: Arc<WriteSerializer<W>>,
) -> AmqpResult<Channel<W>> {
    let id = table.lock().await.allocate()?;
    let (tx, rx) = mpsc::unbounded_channel();
    table.lock().await.insert(id, tx);

    let mut channel = Channel {
        id,
        writer,
        inbound: rx,
        table: table.clone(),
    };

    channel
        .send_frame(FrameType::Method, method::channel_open())
        .await?;

    match channel.recv().await {
        Some(ChannelEvent::Frame(frame)) => {
            let (class_id, method_id, _) = method::split_header(&frame.payload)?;
            if class_id == CLASS_CHANNEL && method_id == CHANNEL_OPEN_OK {
                Ok(channel)
            } else {
                table.lock().await.release(id);
                Err(AmqpError::Protocol(format!(
                    "expected Channel.Open-Ok, got class={class_id} method={method_id}"
                )))
            }
        }
        Some(ChannelEvent::ConnectionClosed { .. }) | None => {
            Err(AmqpError::ClosedConnection)
        }
    }
}
