//! Heartbeat Subsystem
//!
//! Two cooperating tasks, activated only when the negotiated heartbeat
//! interval `H` is greater than zero: a sender that emits a heartbeat
//! frame whenever no octet was written in the last `H` seconds, and a
//! receiver watchdog that force-closes the connection if no octet was
//! read in `2H` seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::codec::Frame;
use crate::state::ConnectionState;
use crate::transport::WriteSerializer;

/// Monotonic, whole-second-resolution timestamps of the last successful
/// write and the last successful read, relative to when the connection
/// was created.
pub struct HeartbeatClocks {
    started: Instant,
    last_send: AtomicU64,
    last_recv: AtomicU64,
}

impl HeartbeatClocks {
    pub fn new() -> Self {
        HeartbeatClocks {
            started: Instant::now(),
            last_send: AtomicU64::new(0),
            last_recv: AtomicU64::new(0),
        }
    }

    fn now_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn touch_send(&self) {
        self.last_send.store(self.now_secs(), Ordering::SeqCst);
    }

    pub fn touch_recv(&self) {
        self.last_recv.store(self.now_secs(), Ordering::SeqCst);
    }

    pub fn reset(&self) {
        let now = self.now_secs();
        self.last_send.store(now, Ordering::SeqCst);
        self.last_recv.store(now, Ordering::SeqCst);
    }

    pub fn seconds_since_send(&self) -> u64 {
        self.now_secs().saturating_sub(self.last_send.load(Ordering::SeqCst))
    }

    pub fn seconds_since_recv(&self) -> u64 {
        self.now_secs().saturating_sub(self.last_recv.load(Ordering::SeqCst))
    }
}

impl Default for HeartbeatClocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles to the two running heartbeat tasks, kept so they can be
/// cancelled together when the connection closes.
pub struct HeartbeatTasks {
    pub sender: tokio::task::JoinHandle<()>,
    pub receiver: tokio::task::JoinHandle<()>,
}

impl HeartbeatTasks {
    pub fn abort(&self) {
        self.sender.abort();
        self.receiver.abort();
    }
}

/// Spawns the sender and receiver-watchdog tasks for a negotiated
/// heartbeat interval of `heartbeat_secs` seconds. `on_timeout` is invoked
/// from the watchdog task when no traffic has been seen for `2H` seconds;
/// it is expected to close the transport without the Close/Close-Ok
/// handshake, per AMQP 0-9-1 section 4.2.7. Both tasks also watch
/// `state_rx` and exit quietly once the connection reaches `Closed`,
/// rather than relying solely on the caller aborting their handles.
pub fn spawn<W, F>(
    heartbeat_secs: u16,
    clocks: Arc<HeartbeatClocks>,
    writer: Arc<WriteSerializer<W>>,
    state_rx: watch::Receiver<ConnectionState>,
    on_timeout: F,
) -> HeartbeatTasks
where
    W: AsyncWrite + Unpin + Send + 'static,
    F: Fn() + Send + 'static,
{
    let h = heartbeat_secs as u64;
    clocks.reset();

    let sender_clocks = clocks.clone();
    let sender_writer = writer;
    let mut sender_state = state_rx.clone();
    let sender = tokio::spawn(async move {
        let poll = Duration::from_secs((h / 2).max(1));
        let mut ticker = interval(poll);
        loop {
            ticker.tick().await;
            if *sender_state.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if sender_clocks.seconds_since_send() >= h {
                if sender_writer.write_frame(&Frame::heartbeat()).await.is_err() {
                    return;
                }
            }
        }
    });

    let receiver_clocks = clocks;
    let mut receiver_state = state_rx;
    let receiver = tokio::spawn(async move {
        let poll = Duration::from_secs((h / 2).max(1));
        let mut ticker = interval(poll);
        loop {
            ticker.tick().await;
            if *receiver_state.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if receiver_clocks.seconds_since_recv() >= 2 * h {
                on_timeout();
                return;
            }
        }
    });

    HeartbeatTasks { sender, receiver }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn sender_emits_heartbeat_when_idle() {
        let (client, server) = tokio::io::duplex(4096);
        let clocks = Arc::new(HeartbeatClocks::new());
        let (mut read_half, _write_half) = tokio::io::split(client);
        let (_server_read, server_write) = tokio::io::split(server);
        let writer = Arc::new(WriteSerializer::new(server_write, clocks.clone()));
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Open);

        let tasks = spawn(1, clocks, writer, state_rx, || {});

        let mut buf = [0u8; 8];
        tokio::time::timeout(StdDuration::from_secs(3), async {
            tokio::io::AsyncReadExt::read_exact(&mut read_half, &mut buf).await.unwrap();
        })
        .await
        .expect("expected a heartbeat frame within 3s");

        assert_eq!(buf[0], crate::codec::FrameType::Heartbeat as u8);
        tasks.abort();
    }

    #[tokio::test]
    async fn watchdog_fires_after_two_intervals_of_silence() {
        let (client, _server) = tokio::io::duplex(4096);
        let clocks = Arc::new(HeartbeatClocks::new());
        let (_read_half, write_half) = tokio::io::split(client);
        let writer = Arc::new(WriteSerializer::new(write_half, clocks.clone()));
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Open);

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let tasks = spawn(1, clocks, writer, state_rx, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(StdDuration::from_millis(2600)).await;
        assert!(fired.load(Ordering::SeqCst));
        tasks.abort();
    }

    #[tokio::test]
    async fn tasks_exit_quietly_once_state_becomes_closed() {
        let (client, _server) = tokio::io::duplex(4096);
        let clocks = Arc::new(HeartbeatClocks::new());
        let (_read_half, write_half) = tokio::io::split(client);
        let writer = Arc::new(WriteSerializer::new(write_half, clocks.clone()));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let tasks = spawn(1, clocks, writer, state_rx, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        state_tx.send(ConnectionState::Closed).unwrap();
        tokio::time::sleep(StdDuration::from_millis(2600)).await;

        assert!(!fired.load(Ordering::SeqCst));
        assert!(tasks.sender.is_finished());
        assert!(tasks.receiver.is_finished());
    }
}
