//! Connection lifecycle states.

/// `Connecting → Open → Closing → Closed`, terminal at `Closed`. Shared
/// between the connection handle, the dispatcher, and the heartbeat tasks
/// via a `tokio::sync::watch` channel so every task observes transitions
/// without a separate notification mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}
