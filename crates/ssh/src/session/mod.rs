//! SSH client session.
//!
//! A [`Session`] owns one connection:
//!
//! 1. [`Session::connect`] exchanges identification lines, runs the first key
//!    exchange and authenticates, all on the caller's task.
//! 2. A dispatch task then owns the read half for the rest of the
//!    connection: channel traffic, global request replies, rekeys and
//!    keep-alive probes.
//! 3. Writers share the write half behind one lock. While a key exchange is
//!    running, everything except key exchange messages and DISCONNECT waits
//!    for the new keys.
//!
//! # Example
//!
//! ```rust,no_run
//! use fynx_ssh::{PasswordAuth, Session, SessionConfig, StrictHostKeyChecking};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> fynx_platform::FynxResult<()> {
//! let config = SessionConfig::default()
//!     .with_strict_host_key_checking(StrictHostKeyChecking::AcceptNew);
//! let session = Session::builder("server.example.com", 22, "admin")
//!     .config(config)
//!     .auth_handler(Arc::new(PasswordAuth::new("secret")))
//!     .build();
//! session.connect().await?;
//!
//! let mut channel = session.open_session().await?;
//! channel.request("exec", true, b"\0\0\0\x06uptime").await?;
//! while let Some(msg) = channel.recv().await {
//!     println!("{:?}", msg);
//! }
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod dispatch;
pub mod keepalive;

use crate::algorithm::{AlgorithmRegistry, CompressionMode};
use crate::auth::{AuthContext, AuthDriver, AuthMethodHandler, AuthTransport};
use crate::channel::{Channel, ChannelTable, PacketSink};
use crate::config::SessionConfig;
use crate::connection::{forward_request_data, ChannelOpen, GlobalRequest};
use crate::kex::{KexCoordinator, KexProgress};
use crate::known_hosts::{
    host_alias, verify_host_key, HostKeyRepository, MemoryHostKeyRepository, UserInfo,
};
use crate::message::{
    bypasses_kex_stall, debug_message, disconnect, ignore_message, is_kex_method,
    unimplemented_sequence, Disconnect, MessageType,
};
use crate::packet::{PacketReader, PacketWriter};
use crate::socket::{SocketFactory, SshStream, TcpSocketFactory};
use crate::version::{read_identification, send_identification};
use crate::wire::Reader;
use async_trait::async_trait;
use fynx_platform::{FynxError, FynxResult};
use keepalive::keepalive_message;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub(crate) type StreamReader = PacketReader<ReadHalf<Box<dyn SshStream>>>;
type StreamWriter = PacketWriter<WriteHalf<Box<dyn SshStream>>>;

type GlobalWaiter = Option<oneshot::Sender<Option<Vec<u8>>>>;

const STATUS_NEW: u8 = 0;
const STATUS_CONNECTING: u8 = 1;
const STATUS_CONNECTED: u8 = 2;
const STATUS_CLOSED: u8 = 3;

/// Receives channels the peer opens (`forwarded-tcpip`, `x11`, agent).
///
/// Each accepted channel is handed over on its own task.
#[async_trait]
pub trait ChannelOpenHandler: Send + Sync {
    /// Serves one peer-opened channel; `open` carries the type specific data.
    async fn handle(&self, channel: Channel, open: ChannelOpen);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// DISCONNECT reason sent when the handshake fails with `err`.
fn handshake_failure_reason(err: &FynxError) -> u32 {
    match err {
        FynxError::MacMismatch { .. } => disconnect::MAC_ERROR,
        FynxError::HostKeyRejected(_) => disconnect::HOST_KEY_NOT_VERIFIABLE,
        FynxError::AuthFailed | FynxError::AuthCancelled => {
            disconnect::NO_MORE_AUTH_METHODS_AVAILABLE
        }
        FynxError::Protocol(_) => disconnect::PROTOCOL_ERROR,
        _ => disconnect::KEY_EXCHANGE_FAILED,
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, what: &str, fut: F) -> FynxResult<T>
where
    F: Future<Output = FynxResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FynxError::Timeout(what.to_string()))?,
        None => fut.await,
    }
}

#[derive(Debug, Default)]
struct CompressionState {
    outbound: Option<String>,
    inbound: Option<String>,
    negotiated: (String, String),
}

/// State shared by the session handle, its channels and the dispatch task.
pub(crate) struct SessionInner {
    host: String,
    port: u16,
    user: String,
    config: SessionConfig,
    registry: Arc<AlgorithmRegistry>,
    host_keys: Arc<dyn HostKeyRepository>,
    user_info: Option<Arc<dyn UserInfo>>,
    open_handlers: HashMap<String, Arc<dyn ChannelOpenHandler>>,

    status: AtomicU8,
    authenticated: AtomicBool,
    writer: tokio::sync::Mutex<Option<StreamWriter>>,
    in_kex: watch::Sender<bool>,
    kex: Mutex<Option<KexCoordinator>>,
    last_kex: Mutex<Instant>,
    compression: Mutex<CompressionState>,
    channels: Mutex<ChannelTable>,
    global_lock: tokio::sync::Mutex<()>,
    global_replies: Mutex<VecDeque<GlobalWaiter>>,
    server_version: Mutex<Option<String>>,
    session_id: Mutex<Option<Vec<u8>>>,
    host_key: Mutex<Option<Vec<u8>>>,
    close_reason: Mutex<Option<(u32, String)>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl SessionInner {
    fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    fn in_kex(&self) -> bool {
        *self.in_kex.borrow()
    }

    /// Error for an operation on a session that is not (or no longer) up.
    fn closed_error(&self) -> FynxError {
        if self.status() == STATUS_CLOSED {
            let (reason, description) = lock(&self.close_reason)
                .clone()
                .unwrap_or((disconnect::CONNECTION_LOST, "session is down".to_string()));
            FynxError::Disconnected {
                reason,
                description,
            }
        } else {
            FynxError::NotConnected
        }
    }

    fn ensure_open(&self) -> FynxResult<()> {
        match self.status() {
            STATUS_CONNECTING | STATUS_CONNECTED => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    fn ensure_connected(&self) -> FynxResult<()> {
        match self.status() {
            STATUS_CONNECTED => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    /// Writes without waiting for a key exchange to finish.
    async fn write_bypass(&self, payload: &[u8]) -> FynxResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        writer.write_packet(payload).await
    }

    /// Writes one payload, waiting out any key exchange first.
    ///
    /// `on_write` runs under the write lock right before the packet goes out.
    async fn write_payload_with<F: FnOnce()>(&self, payload: &[u8], on_write: F) -> FynxResult<()> {
        let msg = payload.first().copied().unwrap_or_default();
        if bypasses_kex_stall(msg) {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
            on_write();
            return writer.write_packet(payload).await;
        }

        let mut in_kex = self.in_kex.subscribe();
        loop {
            self.ensure_open()?;
            if *in_kex.borrow_and_update() {
                trace!(msg, "Write stalled by key exchange");
                in_kex.changed().await.map_err(|_| self.closed_error())?;
                continue;
            }
            let mut guard = self.writer.lock().await;
            if self.in_kex() {
                continue;
            }
            let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
            on_write();
            return writer.write_packet(payload).await;
        }
    }

    async fn write_payload(&self, payload: &[u8]) -> FynxResult<()> {
        self.write_payload_with(payload, || {}).await
    }

    /// Dispatch side write: queued instead of waiting while keys change.
    async fn write_or_defer(&self, payload: Vec<u8>, deferred: &mut Vec<Vec<u8>>) -> FynxResult<()> {
        let mut guard = self.writer.lock().await;
        if self.in_kex() {
            trace!(msg = payload.first().copied().unwrap_or(0), "Reply deferred until new keys");
            deferred.push(payload);
            return Ok(());
        }
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        writer.write_packet(&payload).await
    }

    /// Sends a keep-alive probe from the dispatch task; skipped during a
    /// key exchange.
    async fn probe(&self) -> FynxResult<()> {
        let mut guard = self.writer.lock().await;
        if self.in_kex() {
            return Ok(());
        }
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        lock(&self.global_replies).push_back(None);
        debug!("Sending keep-alive probe");
        writer.write_packet(&keepalive_message()).await
    }

    /// Sends our KEXINIT unless an exchange is already running.
    async fn start_kex(&self) -> FynxResult<bool> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let payload = {
            let mut kex = lock(&self.kex);
            let kex = kex.as_mut().ok_or(FynxError::NotConnected)?;
            if kex.in_progress() {
                return Ok(false);
            }
            kex.send_kexinit()?
        };
        self.in_kex.send_replace(true);
        writer.write_packet(&payload).await?;
        Ok(true)
    }

    /// Handles KEXINIT, NEWKEYS and method messages.
    async fn handle_kex(
        &self,
        reader: &mut StreamReader,
        payload: &[u8],
        deferred: &mut Vec<Vec<u8>>,
    ) -> FynxResult<()> {
        match payload.first().copied().unwrap_or_default() {
            msg if msg == MessageType::KexInit as u8 => {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
                let out = {
                    let mut kex = lock(&self.kex);
                    let kex = kex.as_mut().ok_or(FynxError::NotConnected)?;
                    kex.receive_kexinit(payload)?
                };
                self.in_kex.send_replace(true);
                for message in out {
                    writer.write_packet(&message).await?;
                }
                Ok(())
            }
            msg if msg == MessageType::NewKeys as u8 => self.install_keys(reader, deferred).await,
            _ => {
                let progress = {
                    let mut kex = lock(&self.kex);
                    let kex = kex.as_mut().ok_or(FynxError::NotConnected)?;
                    kex.receive_kex_message(payload)?
                };
                match progress {
                    KexProgress::Send(reply) => self.write_bypass(&reply).await,
                    KexProgress::Ignored => Ok(()),
                    KexProgress::HostKey(blob) => {
                        self.check_host_key(&blob)?;
                        self.write_bypass(&KexCoordinator::newkeys_message()).await
                    }
                }
            }
        }
    }

    fn check_host_key(&self, blob: &[u8]) -> FynxResult<()> {
        let alias = host_alias(&self.host, self.port, self.config.host_key_alias.as_deref());
        verify_host_key(
            self.host_keys.as_ref(),
            self.user_info.as_deref(),
            self.config.strict_host_key_checking,
            &alias,
            blob,
        )?;
        *lock(&self.host_key) = Some(blob.to_vec());
        Ok(())
    }

    /// Adopts the new keys in both directions, then releases stalled writers.
    async fn install_keys(
        &self,
        reader: &mut StreamReader,
        deferred: &mut Vec<Vec<u8>>,
    ) -> FynxResult<()> {
        let (keys, session_id) = {
            let mut kex = lock(&self.kex);
            let kex = kex.as_mut().ok_or(FynxError::NotConnected)?;
            let keys = kex.receive_newkeys()?;
            (keys, kex.session_id().map(<[u8]>::to_vec))
        };
        {
            let mut id = lock(&self.session_id);
            if id.is_none() {
                *id = session_id;
            }
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let outbound = keys.outbound;
        let inbound = keys.inbound;
        debug!(outbound = ?outbound, inbound = ?inbound, "Installing new keys");
        writer.set_keys(outbound.cipher, outbound.mac);
        reader.set_keys(inbound.cipher, inbound.mac);
        {
            let mut compression = lock(&self.compression);
            compression.negotiated = (outbound.compression, inbound.compression);
        }
        self.apply_compression(writer, reader)?;

        for payload in deferred.drain(..) {
            writer.write_packet(&payload).await?;
        }
        *lock(&self.last_kex) = Instant::now();
        self.in_kex.send_replace(false);
        Ok(())
    }

    /// Starts the negotiated compression in each direction where it is not
    /// already running. Delayed methods wait for authentication.
    fn apply_compression(&self, writer: &mut StreamWriter, reader: &mut StreamReader) -> FynxResult<()> {
        let authenticated = self.authenticated.load(Ordering::Acquire);
        let mut state = lock(&self.compression);
        let (out_name, in_name) = state.negotiated.clone();

        if state.outbound.as_deref() != Some(out_name.as_str()) {
            if self.registry.is_delayed_compression(&out_name) && !authenticated {
                writer.set_compressor(None);
                state.outbound = None;
            } else {
                let compressor = self.registry.compressor(&out_name, CompressionMode::Deflate)?;
                state.outbound = compressor.as_ref().map(|_| out_name.clone());
                writer.set_compressor(compressor);
            }
        }
        if state.inbound.as_deref() != Some(in_name.as_str()) {
            if self.registry.is_delayed_compression(&in_name) && !authenticated {
                reader.set_compressor(None);
                state.inbound = None;
            } else {
                let compressor = self.registry.compressor(&in_name, CompressionMode::Inflate)?;
                state.inbound = compressor.as_ref().map(|_| in_name.clone());
                reader.set_compressor(compressor);
            }
        }
        if state.outbound.is_some() || state.inbound.is_some() {
            debug!(outbound = ?state.outbound, inbound = ?state.inbound, "Compression active");
        }
        Ok(())
    }

    async fn on_authenticated(&self, reader: &mut StreamReader) -> FynxResult<()> {
        self.authenticated.store(true, Ordering::Release);
        if let Some(kex) = lock(&self.kex).as_mut() {
            kex.set_authenticated();
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.apply_compression(writer, reader)
    }

    /// Reads the next packet, bounded by `limit`.
    async fn read_packet(reader: &mut StreamReader, limit: Option<Duration>) -> FynxResult<Vec<u8>> {
        with_timeout(limit, "read timed out", reader.read_packet()).await
    }

    /// Acts on transport layer messages. Returns the payload when it belongs
    /// to a higher layer.
    async fn handle_transport(
        &self,
        reader: &mut StreamReader,
        payload: Vec<u8>,
        deferred: &mut Vec<Vec<u8>>,
    ) -> FynxResult<Option<Vec<u8>>> {
        let msg = payload
            .first()
            .copied()
            .ok_or_else(|| FynxError::Protocol("Empty packet".to_string()))?;
        match msg {
            m if m == MessageType::Disconnect as u8 => {
                let d = Disconnect::from_bytes(&payload)?;
                info!(reason = d.reason_code, description = %d.description, "Peer disconnected");
                Err(FynxError::Disconnected {
                    reason: d.reason_code,
                    description: d.description,
                })
            }
            m if m == MessageType::Ignore as u8 => {
                trace!("Ignoring SSH_MSG_IGNORE");
                Ok(None)
            }
            m if m == MessageType::Unimplemented as u8 => {
                warn!(seq = ?unimplemented_sequence(&payload), "Peer reported an unimplemented message");
                Ok(None)
            }
            m if m == MessageType::Debug as u8 => {
                if let Some((_, message)) = debug_message(&payload) {
                    debug!(message = %message, "Peer debug message");
                }
                Ok(None)
            }
            m if m == MessageType::KexInit as u8
                || m == MessageType::NewKeys as u8
                || is_kex_method(m) =>
            {
                self.handle_kex(reader, &payload, deferred).await?;
                Ok(None)
            }
            _ => Ok(Some(payload)),
        }
    }

    /// Ends the session once: wakes every waiter, closes every channel,
    /// closes the transport and drops all key material.
    async fn teardown(&self, reason: u32, description: &str) {
        if self.status.swap(STATUS_CLOSED, Ordering::AcqRel) == STATUS_CLOSED {
            return;
        }
        *lock(&self.close_reason) = Some((reason, description.to_string()));
        self.in_kex.send_replace(false);

        lock(&self.global_replies).clear();
        let channels = lock(&self.channels).drain();
        for channel in channels {
            channel.mark_closed();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.clear_keys();
            let _ = writer.shutdown().await;
        }
        lock(&self.kex).take();
        info!(host = %self.host, reason, description = %description, "Session closed");
    }

    /// Best-effort DISCONNECT followed by teardown.
    async fn close_with(&self, reason: u32, description: &str) {
        if self.status() != STATUS_CLOSED {
            let message = Disconnect::new(reason, description).to_bytes();
            if let Err(e) = self.write_bypass(&message).await {
                debug!(error = %e, "Could not send DISCONNECT");
            }
        }
        self.teardown(reason, description).await;
    }
}

#[async_trait]
impl PacketSink for SessionInner {
    async fn send_payload(&self, payload: Vec<u8>) -> FynxResult<()> {
        self.write_payload(&payload).await
    }
}

/// Packet access for authentication during `connect()`.
struct HandshakeTransport<'a> {
    inner: &'a SessionInner,
    reader: &'a mut StreamReader,
}

#[async_trait]
impl AuthTransport for HandshakeTransport<'_> {
    async fn send(&mut self, payload: &[u8]) -> FynxResult<()> {
        self.inner.write_payload(payload).await
    }

    async fn recv(&mut self) -> FynxResult<Vec<u8>> {
        let mut deferred = Vec::new();
        loop {
            let payload =
                SessionInner::read_packet(self.reader, self.inner.config.timeout).await?;
            if let Some(payload) = self
                .inner
                .handle_transport(self.reader, payload, &mut deferred)
                .await?
            {
                if self.inner.in_kex() {
                    return Err(FynxError::Protocol(format!(
                        "Unexpected message {} during key exchange",
                        payload[0]
                    )));
                }
                return Ok(payload);
            }
        }
    }
}

/// Builds a [`Session`] with its collaborators.
pub struct SessionBuilder {
    host: String,
    port: u16,
    user: String,
    config: SessionConfig,
    registry: Option<AlgorithmRegistry>,
    host_keys: Option<Arc<dyn HostKeyRepository>>,
    user_info: Option<Arc<dyn UserInfo>>,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    auth_handlers: Vec<Arc<dyn AuthMethodHandler>>,
    open_handlers: HashMap<String, Arc<dyn ChannelOpenHandler>>,
}

impl SessionBuilder {
    /// Session to `user@host:port` with default configuration.
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            config: SessionConfig::default(),
            registry: None,
            host_keys: None,
            user_info: None,
            socket_factory: None,
            auth_handlers: Vec::new(),
            open_handlers: HashMap::new(),
        }
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Algorithms to negotiate from; defaults to [`AlgorithmRegistry::with_defaults`].
    pub fn registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Trusted host keys; defaults to an empty in-memory store.
    pub fn host_key_repository(mut self, repository: Arc<dyn HostKeyRepository>) -> Self {
        self.host_keys = Some(repository);
        self
    }

    /// Prompts, banners and warnings.
    pub fn user_info(mut self, user_info: Arc<dyn UserInfo>) -> Self {
        self.user_info = Some(user_info);
        self
    }

    /// Stream provider used by [`Session::connect`]; defaults to TCP.
    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    /// Adds an authentication method handler.
    pub fn auth_handler(mut self, handler: Arc<dyn AuthMethodHandler>) -> Self {
        self.auth_handlers.push(handler);
        self
    }

    /// Serves peer opens of `channel_type`, if the type is allowed.
    pub fn channel_open_handler(
        mut self,
        channel_type: &str,
        handler: Arc<dyn ChannelOpenHandler>,
    ) -> Self {
        self.open_handlers.insert(channel_type.to_string(), handler);
        self
    }

    /// Creates the (unconnected) session.
    pub fn build(self) -> Session {
        let mut auth = AuthDriver::new(self.config.preferred_authentications.clone());
        for handler in self.auth_handlers {
            auth.register(handler);
        }
        let (in_kex, _) = watch::channel(false);
        let inner = SessionInner {
            host: self.host,
            port: self.port,
            user: self.user,
            config: self.config,
            registry: Arc::new(self.registry.unwrap_or_else(AlgorithmRegistry::with_defaults)),
            host_keys: self
                .host_keys
                .unwrap_or_else(|| Arc::new(MemoryHostKeyRepository::new())),
            user_info: self.user_info,
            open_handlers: self.open_handlers,
            status: AtomicU8::new(STATUS_NEW),
            authenticated: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(None),
            in_kex,
            kex: Mutex::new(None),
            last_kex: Mutex::new(Instant::now()),
            compression: Mutex::new(CompressionState::default()),
            channels: Mutex::new(ChannelTable::default()),
            global_lock: tokio::sync::Mutex::new(()),
            global_replies: Mutex::new(VecDeque::new()),
            server_version: Mutex::new(None),
            session_id: Mutex::new(None),
            host_key: Mutex::new(None),
            close_reason: Mutex::new(None),
            dispatch: Mutex::new(None),
        };
        Session {
            inner: Arc::new(inner),
            auth: Arc::new(auth),
            socket_factory: self
                .socket_factory
                .unwrap_or_else(|| Arc::new(TcpSocketFactory)),
        }
    }
}

/// An SSH client session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    auth: Arc<AuthDriver>,
    socket_factory: Arc<dyn SocketFactory>,
}

impl Session {
    /// Starts building a session to `user@host:port`.
    pub fn builder(host: impl Into<String>, port: u16, user: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(host, port, user)
    }

    /// Opens the socket through the factory, then runs [`connect_with_stream`].
    ///
    /// [`connect_with_stream`]: Session::connect_with_stream
    pub async fn connect(&self) -> FynxResult<()> {
        self.inner.config.validate()?;
        let stream = self
            .socket_factory
            .connect(&self.inner.host, self.inner.port, self.inner.config.timeout)
            .await?;
        self.connect_with_stream(stream).await
    }

    /// Runs the handshake over an already open stream: version exchange,
    /// first key exchange and authentication. On success the dispatch task
    /// takes over the read side.
    ///
    /// On failure a DISCONNECT is sent best-effort and the session is closed.
    pub async fn connect_with_stream<S: SshStream>(&self, stream: S) -> FynxResult<()> {
        self.inner.config.validate()?;
        match self.inner.status.compare_exchange(
            STATUS_NEW,
            STATUS_CONNECTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATUS_CLOSED) => return Err(self.inner.closed_error()),
            Err(_) => {
                return Err(FynxError::Protocol(
                    "session is already connected".to_string(),
                ))
            }
        }

        let stream: Box<dyn SshStream> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);
        *self.inner.writer.lock().await = Some(PacketWriter::new(write_half));

        match self.handshake(&mut reader).await {
            Ok(method) => {
                self.inner.status.store(STATUS_CONNECTED, Ordering::Release);
                info!(
                    host = %self.inner.host,
                    user = %self.inner.user,
                    method = %method,
                    "Session established"
                );
                let handle = tokio::spawn(dispatch::run(self.inner.clone(), reader));
                *lock(&self.inner.dispatch) = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.inner.host, error = %e, "Connect failed");
                match &e {
                    FynxError::Disconnected {
                        reason,
                        description,
                    } => self.inner.teardown(*reason, description).await,
                    _ => {
                        self.inner
                            .close_with(handshake_failure_reason(&e), &e.to_string())
                            .await
                    }
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self, reader: &mut StreamReader) -> FynxResult<String> {
        let inner = self.inner.as_ref();
        let timeout = inner.config.timeout;

        {
            let mut guard = inner.writer.lock().await;
            let writer = guard.as_mut().ok_or_else(|| inner.closed_error())?;
            send_identification(writer.get_mut(), &inner.config.client_version).await?;
        }
        let server_version = with_timeout(
            timeout,
            "identification exchange",
            read_identification(reader),
        )
        .await?;
        info!(host = %inner.host, server_version = %server_version, "Connected");
        *lock(&inner.server_version) = Some(server_version.as_str().to_string());

        let proposal = inner.config.proposal(&inner.registry)?;
        *lock(&inner.kex) = Some(KexCoordinator::new(
            inner.registry.clone(),
            proposal,
            &inner.config.client_version,
            server_version.as_str(),
        ));

        inner.start_kex().await?;
        let mut deferred = Vec::new();
        while inner.in_kex() {
            let payload = SessionInner::read_packet(reader, timeout).await?;
            if let Some(payload) = inner.handle_transport(reader, payload, &mut deferred).await? {
                return Err(FynxError::Protocol(format!(
                    "Unexpected message {} during key exchange",
                    payload[0]
                )));
            }
        }

        let session_id = lock(&inner.session_id)
            .clone()
            .ok_or_else(|| FynxError::Protocol("No session identifier".to_string()))?;
        let ctx = AuthContext {
            user: &inner.user,
            session_id: &session_id,
            user_info: inner.user_info.as_deref(),
        };
        let method = {
            let mut transport = HandshakeTransport {
                inner,
                reader: &mut *reader,
            };
            self.auth.run(&ctx, &mut transport).await?
        };
        inner.on_authenticated(reader).await?;
        Ok(method)
    }

    /// Sends DISCONNECT, closes every channel and the transport. Calling it
    /// again, or on a session that never connected, does nothing.
    pub async fn disconnect(&self) {
        match self.inner.status() {
            STATUS_CLOSED => return,
            STATUS_NEW => {
                self.inner.teardown(disconnect::BY_APPLICATION, "disconnected by application").await;
                return;
            }
            _ => {}
        }
        self.inner
            .close_with(disconnect::BY_APPLICATION, "disconnected by application")
            .await;
        if let Some(handle) = lock(&self.inner.dispatch).take() {
            handle.abort();
        }
    }

    /// True between a successful `connect()` and teardown.
    pub fn is_connected(&self) -> bool {
        self.inner.status() == STATUS_CONNECTED
    }

    /// The server's identification string.
    pub fn server_version(&self) -> Option<String> {
        lock(&self.inner.server_version).clone()
    }

    /// Our identification string.
    pub fn client_version(&self) -> &str {
        &self.inner.config.client_version
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        lock(&self.inner.session_id).clone()
    }

    /// Host key accepted in the latest key exchange.
    pub fn host_key(&self) -> Option<Vec<u8>> {
        lock(&self.inner.host_key).clone()
    }

    /// The session's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Opens a channel of `channel_type` with type specific `extra` data and
    /// waits for the peer's confirmation.
    pub async fn open_channel(&self, channel_type: &str, extra: &[u8]) -> FynxResult<Channel> {
        self.inner.ensure_connected()?;
        let window = self.inner.config.local_window_max;
        let max_packet = self.inner.config.local_max_packet;
        let (shared, rx) = lock(&self.inner.channels).create(channel_type, window);
        let waiter = shared.expect_open();

        let mut open = ChannelOpen::new(channel_type, shared.id(), window, max_packet);
        open.extra = extra.to_vec();
        debug!(channel = shared.id(), channel_type = %channel_type, "Opening channel");
        if let Err(e) = self.inner.write_payload(&open.to_bytes()).await {
            lock(&self.inner.channels).remove(shared.id());
            return Err(e);
        }

        let result = tokio::time::timeout(self.inner.config.channel_open_timeout, waiter).await;
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(FynxError::Channel("channel is broken".to_string())),
            Err(_) => Err(FynxError::Timeout(format!(
                "channel {} was not confirmed",
                shared.id()
            ))),
        };
        if let Err(e) = outcome {
            lock(&self.inner.channels).remove(shared.id());
            shared.mark_closed();
            return Err(e);
        }

        let remote_id = shared
            .remote_id()
            .ok_or_else(|| FynxError::Channel("channel is not open".to_string()))?;
        Ok(Channel::new(shared, remote_id, self.inner.clone(), rx))
    }

    /// Opens a `session` channel.
    pub async fn open_session(&self) -> FynxResult<Channel> {
        self.open_channel("session", &[]).await
    }

    /// Sends a global request. With `want_reply`, waits (bounded by
    /// `global_request_timeout`) for the answer: `Some(data)` on
    /// REQUEST_SUCCESS, `None` on REQUEST_FAILURE. Without it, returns
    /// `Some(empty)` once sent.
    pub async fn global_request(
        &self,
        name: &str,
        data: &[u8],
        want_reply: bool,
    ) -> FynxResult<Option<Vec<u8>>> {
        self.inner.ensure_connected()?;
        let _serial = self.inner.global_lock.lock().await;
        let request = GlobalRequest {
            name: name.to_string(),
            want_reply,
            data: data.to_vec(),
        }
        .to_bytes();

        if !want_reply {
            self.inner.write_payload(&request).await?;
            return Ok(Some(Vec::new()));
        }

        let (tx, rx) = oneshot::channel();
        let replies = &self.inner.global_replies;
        self.inner
            .write_payload_with(&request, move || lock(replies).push_back(Some(tx)))
            .await?;
        debug!(name = %name, "Global request sent");

        match tokio::time::timeout(self.inner.config.global_request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.inner.closed_error()),
            Err(_) => Err(FynxError::Timeout(format!("global request {}", name))),
        }
    }

    /// Asks the server to listen on `address:port` and forward connections
    /// back as `forwarded-tcpip` channels. Returns the bound port, which the
    /// server picks when `port` is 0.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> FynxResult<u32> {
        let reply = self
            .global_request("tcpip-forward", &forward_request_data(address, port), true)
            .await?
            .ok_or_else(|| {
                FynxError::Channel(format!(
                    "remote port forwarding failed for listen port {}",
                    port
                ))
            })?;
        if port != 0 {
            return Ok(port);
        }
        Reader::new(&reply).u32()
    }

    /// Cancels a forwarding set up by [`tcpip_forward`](Session::tcpip_forward).
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> FynxResult<()> {
        self.global_request("cancel-tcpip-forward", &forward_request_data(address, port), true)
            .await?
            .map(|_| ())
            .ok_or_else(|| {
                FynxError::Channel(format!("cancel of remote forwarding {} failed", port))
            })
    }

    /// Sends SSH_MSG_IGNORE.
    pub async fn send_ignore(&self) -> FynxResult<()> {
        self.inner.ensure_connected()?;
        self.inner.write_payload(&ignore_message()).await
    }

    /// Sends a `keepalive@jcraft.com` request; the reply is discarded.
    pub async fn send_keepalive(&self) -> FynxResult<()> {
        self.inner.ensure_connected()?;
        let replies = &self.inner.global_replies;
        self.inner
            .write_payload_with(&keepalive_message(), move || lock(replies).push_back(None))
            .await
    }

    /// Runs a key exchange now and waits until the new keys are in use.
    pub async fn rekey(&self) -> FynxResult<()> {
        self.inner.ensure_connected()?;
        let mut in_kex = self.inner.in_kex.subscribe();
        if self.inner.start_kex().await? {
            info!(host = %self.inner.host, "Rekey started");
        }
        while *in_kex.borrow_and_update() {
            in_kex.changed().await.map_err(|_| self.inner.closed_error())?;
        }
        self.inner.ensure_connected()
    }

    /// Completed key exchanges, the first one included.
    pub fn kex_count(&self) -> u32 {
        lock(&self.inner.kex).as_ref().map_or(0, |k| k.exchanges())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("user", &self.inner.user)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
