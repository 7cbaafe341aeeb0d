//! Connection Management
//!
//! The top-level handle: owns the transport, drives the opening
//! handshake to completion, then hands the read half to the dispatcher
//! task and starts the heartbeat tasks if negotiated. Every other
//! operation on a `Connection` first checks the shared state via the
//! `ensure_open` contract.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::channel::{self, Channel, ChannelTable};
use crate::codec::{Frame, FieldTable, FieldValue};
use crate::dispatcher::{self, DispatchOutcome};
use crate::error::{AmqpError, AmqpResult};
use crate::heartbeat::{self, HeartbeatClocks, HeartbeatTasks};
use crate::method::{self, CLASS_CONNECTION, CONNECTION_CLOSE, CONNECTION_OPEN_OK, CONNECTION_START, CONNECTION_TUNE};
use crate::state::ConnectionState;
use crate::transport::{FrameReader, WriteSerializer};

const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Either flavor of `on_error` callback the spec's handshake interface
/// asks for: a plain synchronous observer, or one that does its own
/// awaiting before returning.
pub enum ErrorHook {
    Sync(Box<dyn Fn(&AmqpError) + Send + Sync>),
    Async(Box<dyn Fn(&AmqpError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>),
}

impl ErrorHook {
    async fn fire(&self, err: &AmqpError) {
        match self {
            ErrorHook::Sync(f) => f(err),
            ErrorHook::Async(f) => f(err).await,
        }
    }
}

/// Everything the opening handshake needs and every option a caller may
/// recognize, per the "Recognized configuration" table.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub login: String,
    pub password: String,
    pub virtual_host: String,
    pub login_method: String,
    pub insist: bool,
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
    pub client_properties: FieldTable,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            login: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            login_method: "AMQPLAIN".to_string(),
            insist: false,
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
            client_properties: FieldTable::new(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Builds a `ConnectionConfig` plus an optional `on_error` hook, then
/// drives the TCP connect and handshake.
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    on_error: Option<ErrorHook>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        ConnectionBuilder {
            config: ConnectionConfig::default(),
            on_error: None,
        }
    }

    pub fn login(mut self, login: impl Into<String>) -> Self {
        self.config.login = login.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.config.virtual_host = virtual_host.into();
        self
    }

    pub fn login_method(mut self, login_method: impl Into<String>) -> Self {
        self.config.login_method = login_method.into();
        self
    }

    pub fn insist(mut self, insist: bool) -> Self {
        self.config.insist = insist;
        self
    }

    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.config.channel_max = channel_max;
        self
    }

    pub fn frame_max(mut self, frame_max: u32) -> Self {
        self.config.frame_max = frame_max;
        self
    }

    pub fn heartbeat(mut self, heartbeat: u16) -> Self {
        self.config.heartbeat = heartbeat;
        self
    }

    pub fn client_property(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.config.client_properties.insert(key.into(), value);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.config.connect_timeout = connect_timeout;
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&AmqpError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(ErrorHook::Sync(Box::new(hook)));
        self
    }

    pub fn on_error_async<Fut>(mut self, hook: impl Fn(&AmqpError) -> Fut + Send + Sync + 'static) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(ErrorHook::Async(Box::new(move |err| Box::pin(hook(err)))));
        self
    }

    /// Opens a TCP connection to `host:port` and runs the opening
    /// handshake. Fails with `ClosedConnection` if the peer drops the
    /// connection before completing it.
    pub async fn connect(self, host: &str, port: u16) -> AmqpResult<Connection<TcpStream>> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AmqpError::Protocol("connect timed out".into()))??;
        stream.set_nodelay(true)?;
        Connection::handshake(stream, self.config, self.on_error).await
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An open connection to an AMQP broker: owns the write serializer, the
/// channel table, the negotiated tuning triple, and the dispatcher and
/// heartbeat task handles.
pub struct Connection<S> {
    connection_id: String,
    writer: Arc<WriteSerializer<WriteHalf<S>>>,
    channels: Arc<Mutex<ChannelTable>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    clocks: Arc<HeartbeatClocks>,
    heartbeat_tasks: Option<HeartbeatTasks>,
    dispatcher_abort: AbortHandle,
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
    server_properties: FieldTable,
    server_mechanisms: Vec<String>,
    server_locales: Vec<String>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Runs the opening handshake over an already-connected stream, then
    /// spawns the dispatcher and (if negotiated) the heartbeat tasks.
    pub async fn handshake(
        stream: S,
        config: ConnectionConfig,
        on_error: Option<ErrorHook>,
    ) -> AmqpResult<Self> {
        let connection_id = Uuid::new_v4().to_string();
        let (read_half, write_half) = split(stream);

        let clocks = Arc::new(HeartbeatClocks::new());
        let writer = Arc::new(WriteSerializer::new(write_half, clocks.clone()));
        let mut reader = FrameReader::new(read_half, clocks.clone());

        log::debug!("{connection_id}: sending protocol header");
        writer.write_raw(&PROTOCOL_HEADER).await?;

        let start = Self::read_method(&mut reader, CLASS_CONNECTION, CONNECTION_START).await?;
        let start = method::Start::decode(&start)?;
        log::info!(
            "{connection_id}: server offers mechanisms={:?} locales={:?}",
            start.mechanisms,
            start.locales
        );

        let mechanism = Self::negotiate_mechanism(&config.login_method, &start.mechanisms);
        let response = Self::encode_auth_response(&mechanism, &config.login, &config.password)?;
        let client_properties = Self::client_properties(&config.client_properties);
        let locale = start
            .locales
            .split_whitespace()
            .next()
            .unwrap_or("en_US")
            .to_string();

        let start_ok = method::StartOk {
            client_properties,
            mechanism: mechanism.clone(),
            response,
            locale,
        };
        writer
            .write_frame(&Frame::method(0, start_ok.encode()?))
            .await?;

        let tune = Self::read_method(&mut reader, CLASS_CONNECTION, CONNECTION_TUNE).await?;
        let tune = method::Tune::decode(&tune)?;

        let channel_max = Self::negotiate_max16(config.channel_max, tune.channel_max);
        let frame_max = Self::negotiate_max(config.frame_max, tune.frame_max);
        let heartbeat = Self::negotiate_heartbeat(config.heartbeat, tune.heartbeat);

        let tune_ok = method::TuneOk {
            channel_max,
            frame_max,
            heartbeat,
        };
        writer
            .write_frame(&Frame::method(0, tune_ok.encode()))
            .await?;

        let open = method::Open {
            virtual_host: config.virtual_host.clone(),
            capabilities: String::new(),
            insist: config.insist,
        };
        writer
            .write_frame(&Frame::method(0, open.encode()?))
            .await?;

        Self::read_open_ok(&mut reader).await?;
        log::info!("{connection_id}: connection open, tuning={channel_max}/{frame_max}/{heartbeat}");

        let channels = Arc::new(Mutex::new(ChannelTable::new(channel_max)));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        clocks.reset();

        let dispatcher_task = tokio::spawn(dispatcher::run(
            reader,
            writer.clone(),
            channels.clone(),
            state_tx.clone(),
            state_rx.clone(),
        ));
        let dispatcher_abort = dispatcher_task.abort_handle();

        // Set by the heartbeat watchdog's `on_timeout` closure just before it
        // force-closes the transport, so the supervisor below can recover
        // the real cause even though aborting the dispatcher task makes its
        // `JoinHandle` resolve to `Err(JoinError)` rather than a `DispatchOutcome`.
        let heartbeat_cause: Arc<StdMutex<Option<AmqpError>>> = Arc::new(StdMutex::new(None));

        let heartbeat_tasks = if heartbeat > 0 {
            let timeout_state_tx = state_tx.clone();
            let timeout_writer = writer.clone();
            let timeout_abort = dispatcher_abort.clone();
            let timeout_cause = heartbeat_cause.clone();
            let timeout_connection_id = connection_id.clone();
            Some(heartbeat::spawn(
                heartbeat,
                clocks.clone(),
                writer.clone(),
                state_rx.clone(),
                move || {
                    log::warn!(
                        "{timeout_connection_id}: heartbeat timeout, force-closing connection"
                    );
                    *timeout_cause.lock().unwrap() = Some(AmqpError::HeartbeatTimeout);
                    let _ = timeout_state_tx.send(ConnectionState::Closed);
                    timeout_abort.abort();
                    let shutdown_writer = timeout_writer.clone();
                    tokio::spawn(async move {
                        let _ = shutdown_writer.shutdown().await;
                    });
                },
            ))
        } else {
            None
        };

        if let Some(hook) = on_error {
            let connection_id = connection_id.clone();
            tokio::spawn(async move {
                let cause = match dispatcher_task.await {
                    Ok(DispatchOutcome::LocalCloseConfirmed) => None,
                    Ok(DispatchOutcome::PeerClosed { reply_code, reply_text }) => {
                        Some(AmqpError::Protocol(format!(
                            "connection closed by peer: {reply_text} ({reply_code})"
                        )))
                    }
                    Ok(DispatchOutcome::TransportClosed { reason }) => {
                        Some(AmqpError::Protocol(reason))
                    }
                    Err(_join_err) => Some(
                        heartbeat_cause
                            .lock()
                            .unwrap()
                            .take()
                            .unwrap_or(AmqpError::ClosedConnection),
                    ),
                };
                if let Some(cause) = cause {
                    log::warn!("{connection_id}: connection closed abnormally: {cause}");
                    hook.fire(&cause).await;
                }
            });
        }

        Ok(Connection {
            connection_id,
            writer,
            channels,
            state_tx,
            state_rx,
            clocks,
            heartbeat_tasks,
            dispatcher_abort,
            channel_max,
            frame_max,
            heartbeat,
            server_properties: start.server_properties,
            server_mechanisms: start
                .mechanisms
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            server_locales: start
                .locales
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        })
    }

    fn negotiate_mechanism(requested: &str, server_mechanisms: &str) -> String {
        let offered: Vec<&str> = server_mechanisms.split_whitespace().collect();
        if (requested == "AMQPLAIN" || requested == "PLAIN") && offered.contains(&requested) {
            requested.to_string()
        } else {
            log::warn!(
                "login_method {requested:?} not recognized or not offered by server ({server_mechanisms:?}), falling back to AMQPLAIN"
            );
            "AMQPLAIN".to_string()
        }
    }

    fn encode_auth_response(mechanism: &str, login: &str, password: &str) -> AmqpResult<Vec<u8>> {
        if mechanism == "PLAIN" {
            let mut response = Vec::with_capacity(login.len() + password.len() + 2);
            response.push(0);
            response.extend_from_slice(login.as_bytes());
            response.push(0);
            response.extend_from_slice(password.as_bytes());
            Ok(response)
        } else {
            let mut auth = FieldTable::new();
            auth.insert("LOGIN".to_string(), FieldValue::LongString(login.as_bytes().to_vec()));
            auth.insert(
                "PASSWORD".to_string(),
                FieldValue::LongString(password.as_bytes().to_vec()),
            );
            let mut buf = bytes::BytesMut::new();
            let mut enc = crate::codec::Encoder::new(&mut buf);
            enc.write_table(&auth)?;
            Ok(buf.to_vec())
        }
    }

    fn client_properties(user: &FieldTable) -> FieldTable {
        let mut props = FieldTable::new();
        props.insert(
            "product".to_string(),
            FieldValue::LongString(b"amqp-core".to_vec()),
        );
        props.insert(
            "product_version".to_string(),
            FieldValue::LongString(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
        );
        props.insert(
            "copyright".to_string(),
            FieldValue::LongString(b"".to_vec()),
        );
        let mut capabilities = FieldTable::new();
        capabilities.insert("consumer_cancel_notify".to_string(), FieldValue::Boolean(true));
        capabilities.insert(
            "connection.blocked".to_string(),
            FieldValue::Boolean(false),
        );
        props.insert("capabilities".to_string(), FieldValue::FieldTable(capabilities));
        for (key, value) in user {
            props.insert(key.clone(), value.clone());
        }
        props
    }

    fn negotiate_max(client: u32, server: u32) -> u32 {
        match (client, server) {
            (0, s) => s,
            (c, 0) => c,
            (c, s) => c.min(s),
        }
    }

    fn negotiate_max16(client: u16, server: u16) -> u16 {
        match (client, server) {
            (0, s) => s,
            (c, 0) => c,
            (c, s) => c.min(s),
        }
    }

    fn negotiate_heartbeat(client: u16, server: u16) -> u16 {
        if client == 0 || server == 0 {
            0
        } else {
            client.min(server)
        }
    }

    async fn read_method(
        reader: &mut FrameReader<ReadHalf<S>>,
        expected_class: u16,
        expected_method: u16,
    ) -> AmqpResult<Vec<u8>> {
        let frame = reader
            .next_frame()
            .await?
            .ok_or(AmqpError::ClosedConnection)?;
        let (class_id, method_id, args) = method::split_header(&frame.payload)?;
        if class_id == CLASS_CONNECTION && method_id == CONNECTION_CLOSE {
            let close = method::Close::decode(args)?;
            return Err(if close.reply_code == 403 {
                AmqpError::Authentication(close.reply_text)
            } else {
                AmqpError::Protocol(format!("{} ({})", close.reply_text, close.reply_code))
            });
        }
        if class_id != expected_class || method_id != expected_method {
            return Err(AmqpError::Protocol(format!(
                "expected class={expected_class} method={expected_method}, got class={class_id} method={method_id}"
            )));
        }
        Ok(args.to_vec())
    }

    async fn read_open_ok(reader: &mut FrameReader<ReadHalf<S>>) -> AmqpResult<()> {
        Self::read_method(reader, CLASS_CONNECTION, CONNECTION_OPEN_OK)
            .await
            .map(|_| ())
    }

    pub fn id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn channel_max(&self) -> u16 {
        self.channel_max
    }

    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    pub fn heartbeat_interval(&self) -> u16 {
        self.heartbeat
    }

    /// Seconds since the transport last saw a successful write, useful
    /// for callers that want to observe heartbeat suppression directly.
    pub fn seconds_since_last_send(&self) -> u64 {
        self.clocks.seconds_since_send()
    }

    /// Seconds since the transport last saw a successful read.
    pub fn seconds_since_last_recv(&self) -> u64 {
        self.clocks.seconds_since_recv()
    }

    pub fn server_properties(&self) -> &FieldTable {
        &self.server_properties
    }

    pub fn server_mechanisms(&self) -> &[String] {
        &self.server_mechanisms
    }

    pub fn server_locales(&self) -> &[String] {
        &self.server_locales
    }

    /// The Ensure-Open contract: every user-facing operation runs this
    /// first.
    pub async fn ensure_open(&self) -> AmqpResult<()> {
        match *self.state_rx.borrow() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closed => Err(AmqpError::ClosedConnection),
            ConnectionState::Connecting => Err(AmqpError::NotEstablished),
            ConnectionState::Closing => {
                let _ = self.wait_closed(None).await;
                Err(AmqpError::ClosedConnection)
            }
        }
    }

    /// Allocates a channel, opens it on the wire, and returns once
    /// `Channel.Open-Ok` has been received.
    pub async fn new_channel(&self) -> AmqpResult<Channel<WriteHalf<S>>> {
        self.ensure_open().await?;
        channel::open_channel(self.channels.clone(), self.writer.clone()).await
    }

    /// Initiates a clean shutdown: sends `Connection.Close` and, unless
    /// `no_wait`, awaits `Close-Ok` (bounded by `timeout` if given).
    pub async fn close(&mut self, no_wait: bool, close_timeout: Option<Duration>) -> AmqpResult<()> {
        if *self.state_rx.borrow() == ConnectionState::Closed {
            return Err(AmqpError::ClosedConnection);
        }
        let _ = self.state_tx.send(ConnectionState::Closing);
        self.writer
            .write_frame(&Frame::method(0, method::Close::clean().encode()?))
            .await?;

        if no_wait {
            return Ok(());
        }
        self.wait_closed(close_timeout).await
    }

    /// Resolves once the connection reaches `Closed`, bounded by an
    /// optional timeout; a timeout does not abort the underlying close.
    pub async fn wait_closed(&self, wait_timeout: Option<Duration>) -> AmqpResult<()> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() == ConnectionState::Closed {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match wait_timeout {
            Some(d) => timeout(d, wait)
                .await
                .map_err(|_| AmqpError::Protocol("wait_closed timed out".into())),
            None => {
                wait.await;
                Ok(())
            }
        }
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        if let Some(tasks) = self.heartbeat_tasks.take() {
            tasks.abort();
        }
        self.dispatcher_abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn read_frame_sync(buf: &mut Vec<u8>) -> Option<(u8, u16, Vec<u8>)> {
        if buf.len() < 7 {
            return None;
        }
        let frame_type = buf[0];
        let channel = u16::from_be_bytes([buf[1], buf[2]]);
        let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
        if buf.len() < 7 + size + 1 {
            return None;
        }
        let payload = buf[7..7 + size].to_vec();
        buf.drain(0..7 + size + 1);
        Some((frame_type, channel, payload))
    }

    async fn drive_broker_side(mut sock: tokio::io::DuplexStream, heartbeat: u16) {
        let mut header = [0u8; 8];
        sock.read_exact(&mut header).await.unwrap();
        assert_eq!(&header, &PROTOCOL_HEADER);

        let mut buf: Vec<u8> = Vec::new();
        let mut props = FieldTable::new();
        let start = method::Start {
            version_major: 0,
            version_minor: 9,
            server_properties: {
                props.insert("product".into(), FieldValue::ShortString("broker".into()));
                props.clone()
            },
            mechanisms: "AMQPLAIN PLAIN".to_string(),
            locales: "en_US".to_string(),
        };
        let payload = {
            let mut b = bytes::BytesMut::new();
            let mut enc = Encoder::new(&mut b);
            enc.write_short(CLASS_CONNECTION);
            enc.write_short(CONNECTION_START);
            enc.write_octet(start.version_major);
            enc.write_octet(start.version_minor);
            enc.write_table(&start.server_properties).unwrap();
            enc.write_longstr(start.mechanisms.as_bytes());
            enc.write_longstr(start.locales.as_bytes());
            b.to_vec()
        };
        write_frame_raw(&mut sock, 0, &payload).await;

        let (_class, _method, _args) = read_frame_from(&mut sock, &mut buf).await; // Start-Ok

        let tune_ok = method::TuneOk {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat,
        };
        let payload = {
            let mut b = bytes::BytesMut::new();
            let mut enc = Encoder::new(&mut b);
            enc.write_short(CLASS_CONNECTION);
            enc.write_short(CONNECTION_TUNE);
            enc.write_short(tune_ok.channel_max);
            enc.write_long(tune_ok.frame_max);
            enc.write_short(tune_ok.heartbeat);
            b.to_vec()
        };
        write_frame_raw(&mut sock, 0, &payload).await;

        let (_class, _method, _args) = read_frame_from(&mut sock, &mut buf).await; // Tune-Ok
        let (_class, _method, _args) = read_frame_from(&mut sock, &mut buf).await; // Open

        let payload = {
            let mut b = bytes::BytesMut::new();
            let mut enc = Encoder::new(&mut b);
            enc.write_short(CLASS_CONNECTION);
            enc.write_short(CONNECTION_OPEN_OK);
            b.to_vec()
        };
        write_frame_raw(&mut sock, 0, &payload).await;

        // keep the broker side alive until the test drops it
        std::future::pending::<()>().await;
    }

    async fn write_frame_raw(sock: &mut tokio::io::DuplexStream, channel: u16, payload: &[u8]) {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.push(1u8);
        out.extend_from_slice(&channel.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out.push(0xCE);
        sock.write_all(&out).await.unwrap();
    }

    async fn read_frame_from(sock: &mut tokio::io::DuplexStream, buf: &mut Vec<u8>) -> (u16, u16, Vec<u8>) {
        loop {
            if let Some((_type, _channel, payload)) = read_frame_sync(buf) {
                let (class_id, method_id, args) = method::split_header(&payload).unwrap();
                return (class_id, method_id, args.to_vec());
            }
            let mut chunk = [0u8; 4096];
            let n = sock.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn handshake_completes_and_opens_connection() {
        let (client_sock, broker_sock) = tokio::io::duplex(8192);
        let broker = tokio::spawn(drive_broker_side(broker_sock, 0));

        let config = ConnectionConfig {
            heartbeat: 0,
            ..ConnectionConfig::default()
        };
        let connection = Connection::handshake(client_sock, config, None).await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.channel_max(), 2047);
        assert_eq!(connection.frame_max(), 131_072);
        assert_eq!(connection.heartbeat_interval(), 0);
        assert!(connection.server_mechanisms().contains(&"AMQPLAIN".to_string()));

        broker.abort();
    }

    #[tokio::test]
    async fn heartbeat_timeout_force_closes_and_fires_on_error_with_the_real_cause() {
        let (client_sock, broker_sock) = tokio::io::duplex(8192);
        let broker = tokio::spawn(drive_broker_side(broker_sock, 1));

        let captured: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let captured_clone = captured.clone();
        let hook = ErrorHook::Sync(Box::new(move |err: &AmqpError| {
            *captured_clone.lock().unwrap() = Some(err.to_string());
        }));

        let config = ConnectionConfig {
            heartbeat: 1,
            ..ConnectionConfig::default()
        };
        let connection = Connection::handshake(client_sock, config, Some(hook))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(captured.lock().unwrap().as_deref(), Some("heartbeat timeout"));

        broker.abort();
    }

    #[tokio::test]
    async fn clean_close_does_not_fire_on_error() {
        let (client_sock, broker_sock) = tokio::io::duplex(8192);
        let broker = tokio::spawn(drive_broker_side(broker_sock, 0));

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        let hook = ErrorHook::Sync(Box::new(move |_err: &AmqpError| {
            fired_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        let config = ConnectionConfig {
            heartbeat: 0,
            ..ConnectionConfig::default()
        };
        let mut connection = Connection::handshake(client_sock, config, Some(hook))
            .await
            .unwrap();

        connection.close(false, Some(Duration::from_secs(1))).await.ok();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
        broker.abort();
    }

    #[test]
    fn negotiate_max_takes_minimum_unless_either_side_is_unbounded() {
        assert_eq!(Connection::<TcpStream>::negotiate_max(1000, 2047), 1000);
        assert_eq!(Connection::<TcpStream>::negotiate_max(0, 2047), 2047);
        assert_eq!(Connection::<TcpStream>::negotiate_max(1000, 0), 1000);
        assert_eq!(Connection::<TcpStream>::negotiate_max16(1000, 2047), 1000);
    }

    #[test]
    fn negotiate_heartbeat_disables_if_either_side_is_zero() {
        assert_eq!(Connection::<TcpStream>::negotiate_heartbeat(60, 30), 30);
        assert_eq!(Connection::<TcpStream>::negotiate_heartbeat(0, 30), 0);
        assert_eq!(Connection::<TcpStream>::negotiate_heartbeat(60, 0), 0);
    }

    #[test]
    fn encode_auth_response_plain_uses_nul_separated_layout() {
        let response = Connection::<TcpStream>::encode_auth_response("PLAIN", "guest", "guest").unwrap();
        assert_eq!(response, b"\0guest\0guest");
    }
}
