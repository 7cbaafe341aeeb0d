//! Write Serializer and frame-oriented reading.
//!
//! The write serializer is the one mutex in this crate: it guarantees a
//! composed frame (or a method+header+body sequence) reaches the transport
//! atomically and that flushes never interleave. The reader side is a
//! small buffering helper used by the dispatcher to pull complete frames
//! off a byte stream one at a time.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::codec::Frame;
use crate::error::AmqpResult;
use crate::heartbeat::HeartbeatClocks;

/// Single-owner lock over the write half of the transport. Every sender —
/// connection handshake, heartbeat, or a channel publishing a
/// method+header+body triplet — goes through here, so no two writers can
/// ever interleave their frames on the wire.
pub struct WriteSerializer<W> {
    writer: Mutex<W>,
    clocks: Arc<HeartbeatClocks>,
}

impl<W: AsyncWrite + Unpin> WriteSerializer<W> {
    pub fn new(writer: W, clocks: Arc<HeartbeatClocks>) -> Self {
        WriteSerializer {
            writer: Mutex::new(writer),
            clocks,
        }
    }

    /// Writes a single frame and flushes.
    pub async fn write_frame(&self, frame: &Frame) -> AmqpResult<()> {
        self.write_frames(std::slice::from_ref(frame)).await
    }

    /// Writes a sequence of frames under one lock acquisition and flushes
    /// once at the end, so a method+header+body composition can never be
    /// interleaved with another writer's frames on the same channel.
    pub async fn write_frames(&self, frames: &[Frame]) -> AmqpResult<()> {
        let mut writer = self.writer.lock().await;
        for frame in frames {
            let encoded = frame.encode();
            writer.write_all(&encoded).await?;
        }
        writer.flush().await?;
        drop(writer);
        self.clocks.touch_send();
        Ok(())
    }

    /// Writes the raw protocol header; this precedes any framed traffic
    /// and is not itself wrapped in a frame envelope.
    pub async fn write_raw(&self, bytes: &[u8]) -> AmqpResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        drop(writer);
        self.clocks.touch_send();
        Ok(())
    }

    /// Shuts the transport down without writing anything further. Used by
    /// the heartbeat watchdog, which closes the connection immediately on
    /// timeout rather than attempting the `Close`/`Close-Ok` handshake.
    pub async fn shutdown(&self) -> AmqpResult<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Buffers bytes off an `AsyncRead` and yields complete frames one at a
/// time, touching the receive clock on every delivered byte so that even
/// a frame that later fails to parse counts as traffic.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    clocks: Arc<HeartbeatClocks>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, clocks: Arc<HeartbeatClocks>) -> Self {
        FrameReader {
            reader,
            buf: BytesMut::with_capacity(8192),
            clocks,
        }
    }

    /// Reads and returns the next complete frame, reading more from the
    /// underlying stream as needed. Returns `Ok(None)` on clean EOF.
    pub async fn next_frame(&mut self) -> AmqpResult<Option<Frame>> {
        loop {
            if let Some((frame, consumed)) = Frame::decode(&self.buf)? {
                let _ = self.buf.split_to(consumed);
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.clocks.touch_recv();
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
