//! SSH channels and their flow control (RFC 4254 Section 5).
//!
//! Every channel has two windows:
//!
//! - the **local** window: bytes the peer may still send us. The dispatch
//!   loop shrinks it on each data message and refuses data past it.
//!   [`Channel::recv`] hands the bytes the application has read back to the
//!   peer with a WINDOW_ADJUST once the window falls below half, so unread
//!   data never exceeds the window.
//! - the **remote** window: bytes we may still send. [`Channel::write`]
//!   consumes it and waits on the channel's [`Notify`] when it runs out. A
//!   WINDOW_ADJUST, a close or a disconnect wakes the writer.
//!
//! Writers never hold the session's write lock while waiting for window, so
//! the dispatch loop can always deliver the adjust that unblocks them.

use crate::connection::{encode_channel_only, encode_data, ChannelRequest, ChannelWindowAdjust};
use crate::message::MessageType;
use crate::packet::MAX_PACKET_LENGTH;
use async_trait::async_trait;
use fynx_platform::{FynxError, FynxResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace};

/// Default local window (1 MiB).
pub const DEFAULT_LOCAL_WINDOW: u32 = 0x10_0000;
/// Default largest packet we accept (16 KiB).
pub const DEFAULT_LOCAL_MAX_PACKET: u32 = 0x4000;
/// Largest packet size we may advertise. Leaves room below the decoder's
/// [`MAX_PACKET_LENGTH`] for the EXTENDED_DATA header, padding and zlib
/// growth.
pub const MAX_LOCAL_MAX_PACKET: u32 = (MAX_PACKET_LENGTH - 256) as u32;

/// Outbound path for channel messages; implemented by the session.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Queues one payload for the transport, honoring the key exchange stall.
    async fn send_payload(&self, payload: Vec<u8>) -> FynxResult<()>;
}

/// Inbound event on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// CHANNEL_DATA
    Data(Vec<u8>),
    /// CHANNEL_EXTENDED_DATA with its type code
    ExtendedData(u32, Vec<u8>),
    /// The peer will send no more data.
    Eof,
    /// `exit-status` request from the peer.
    ExitStatus(u32),
}

#[derive(Debug)]
pub(crate) struct ChannelState {
    remote_id: Option<u32>,
    remote_window: u64,
    remote_max_packet: u32,
    local_window: u32,
    local_window_max: u32,
    /// Bytes read by the application and not yet returned to the peer.
    consumed: u32,
    eof_local: bool,
    eof_remote: bool,
    close_sent: bool,
    closed: bool,
    exit_status: Option<u32>,
    open_result: Option<oneshot::Sender<FynxResult<()>>>,
    request_reply: Option<oneshot::Sender<bool>>,
    inbound: Option<mpsc::UnboundedSender<ChannelMessage>>,
}

/// State shared between a [`Channel`] handle and the dispatch loop.
#[derive(Debug)]
pub(crate) struct ChannelShared {
    id: u32,
    channel_type: String,
    state: Mutex<ChannelState>,
    notify: Notify,
    request_lock: tokio::sync::Mutex<()>,
}

impl ChannelShared {
    pub(crate) fn new(
        id: u32,
        channel_type: &str,
        local_window_max: u32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            channel_type: channel_type.to_string(),
            state: Mutex::new(ChannelState {
                remote_id: None,
                remote_window: 0,
                remote_max_packet: 0,
                local_window: local_window_max,
                local_window_max,
                consumed: 0,
                eof_local: false,
                eof_remote: false,
                close_sent: false,
                closed: false,
                exit_status: None,
                open_result: None,
                request_reply: None,
                inbound: Some(tx),
            }),
            notify: Notify::new(),
            request_lock: tokio::sync::Mutex::new(()),
        });
        (shared, rx)
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn remote_id(&self) -> Option<u32> {
        self.lock().remote_id
    }

    /// Registers the waiter for our own CHANNEL_OPEN.
    pub(crate) fn expect_open(&self) -> oneshot::Receiver<FynxResult<()>> {
        let (tx, rx) = oneshot::channel();
        self.lock().open_result = Some(tx);
        rx
    }

    /// Records the peer's side of an open, from either direction.
    pub(crate) fn confirm_open(&self, remote_id: u32, window: u32, max_packet: u32) {
        let waiter = {
            let mut st = self.lock();
            st.remote_id = Some(remote_id);
            st.remote_window = u64::from(window);
            st.remote_max_packet = max_packet;
            st.open_result.take()
        };
        debug!(channel = self.id, remote = remote_id, window, max_packet, "Channel open");
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    pub(crate) fn fail_open(&self, reason: u32, description: &str) {
        let waiter = self.lock().open_result.take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(FynxError::Channel(format!(
                "failed to open channel ({}): {}",
                reason, description
            ))));
        }
        self.mark_closed();
    }

    /// Hands received data to the reader.
    pub(crate) fn deliver(&self, message: ChannelMessage) {
        let st = self.lock();
        if let Some(tx) = &st.inbound {
            let _ = tx.send(message);
        }
    }

    /// Charges `len` received bytes to the local window. False when the
    /// peer sent more than the window allows.
    pub(crate) fn receive_data(&self, len: usize) -> bool {
        let mut st = self.lock();
        match u32::try_from(len) {
            Ok(len) if len <= st.local_window => {
                st.local_window -= len;
                true
            }
            _ => false,
        }
    }

    /// Records `len` bytes read by the application. Returns the adjustment
    /// to send once the window has dropped below half its maximum.
    pub(crate) fn release_local_window(&self, len: usize) -> Option<u32> {
        let mut st = self.lock();
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        st.consumed = st.consumed.saturating_add(len);
        if st.closed || st.close_sent || st.local_window >= st.local_window_max / 2 {
            return None;
        }
        let add = st.consumed.min(st.local_window_max - st.local_window);
        if add == 0 {
            return None;
        }
        st.consumed -= add;
        st.local_window += add;
        Some(add)
    }

    /// Adds send credit and wakes blocked writers.
    pub(crate) fn add_remote_window(&self, bytes: u32) {
        {
            let mut st = self.lock();
            st.remote_window = st.remote_window.saturating_add(u64::from(bytes));
            trace!(channel = self.id, window = st.remote_window, "Remote window adjusted");
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn set_eof_remote(&self) {
        self.lock().eof_remote = true;
        self.deliver(ChannelMessage::Eof);
    }

    pub(crate) fn set_exit_status(&self, status: u32) {
        self.lock().exit_status = Some(status);
        self.deliver(ChannelMessage::ExitStatus(status));
    }

    pub(crate) fn resolve_request(&self, success: bool) {
        let waiter = self.lock().request_reply.take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(success);
        }
    }

    /// On the peer's CLOSE: the remote id to answer with our own CLOSE, or
    /// `None` when we already sent one.
    pub(crate) fn take_close_reply(&self) -> Option<u32> {
        let mut st = self.lock();
        if st.close_sent {
            return None;
        }
        st.close_sent = true;
        st.remote_id
    }

    /// Final state: wakes every waiter and ends the inbound stream.
    pub(crate) fn mark_closed(&self) {
        let (open, request) = {
            let mut st = self.lock();
            st.closed = true;
            st.inbound = None;
            (st.open_result.take(), st.request_reply.take())
        };
        if let Some(open) = open {
            let _ = open.send(Err(FynxError::Channel("channel is broken".to_string())));
        }
        if let Some(request) = request {
            let _ = request.send(false);
        }
        self.notify.notify_waiters();
    }

    /// Takes up to `wanted` bytes of send credit, waiting while there is none.
    async fn reserve(&self, wanted: usize) -> FynxResult<(u32, usize)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if st.closed || st.close_sent || st.eof_local {
                    return Err(FynxError::Channel("channel is broken".to_string()));
                }
                let remote_id = st
                    .remote_id
                    .ok_or_else(|| FynxError::Channel("channel is not open".to_string()))?;
                if st.remote_window > 0 {
                    let max_packet = st.remote_max_packet.max(1) as usize;
                    let window = usize::try_from(st.remote_window).unwrap_or(usize::MAX);
                    let n = wanted.min(window).min(max_packet);
                    st.remote_window -= n as u64;
                    return Ok((remote_id, n));
                }
            }
            trace!(channel = self.id, "Waiting for remote window");
            notified.await;
        }
    }
}

/// Handle to an open channel.
///
/// Dropping the handle does not close the channel; call [`Channel::close`].
pub struct Channel {
    shared: Arc<ChannelShared>,
    remote_id: u32,
    sink: Arc<dyn PacketSink>,
    inbound: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        remote_id: u32,
        sink: Arc<dyn PacketSink>,
        inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    ) -> Self {
        Self {
            shared,
            remote_id,
            sink,
            inbound,
        }
    }

    /// Our channel number.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// The peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Channel type name (`session`, `forwarded-tcpip`, ...).
    pub fn channel_type(&self) -> &str {
        &self.shared.channel_type
    }

    /// Sends data, split to the peer's packet size, waiting for window.
    ///
    /// Fails with [`FynxError::Channel`] once the channel is closed, also
    /// while waiting.
    pub async fn write(&self, data: &[u8]) -> FynxResult<()> {
        self.write_with(None, data).await
    }

    /// Sends extended data (e.g. [`crate::connection::EXTENDED_DATA_STDERR`]).
    pub async fn write_extended(&self, code: u32, data: &[u8]) -> FynxResult<()> {
        self.write_with(Some(code), data).await
    }

    async fn write_with(&self, code: Option<u32>, mut data: &[u8]) -> FynxResult<()> {
        while !data.is_empty() {
            let (remote_id, n) = self.shared.reserve(data.len()).await?;
            let (chunk, rest) = data.split_at(n);
            self.sink.send_payload(encode_data(remote_id, code, chunk)).await?;
            trace!(channel = self.shared.id, len = n, "Sent channel data");
            data = rest;
        }
        Ok(())
    }

    /// Next inbound event, `None` once the channel is closed.
    ///
    /// Reading data returns window to the peer.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        let message = self.inbound.recv().await?;
        if let ChannelMessage::Data(data) | ChannelMessage::ExtendedData(_, data) = &message {
            if let Some(bytes_to_add) = self.shared.release_local_window(data.len()) {
                trace!(channel = self.shared.id, bytes_to_add, "Restoring local window");
                let adjust = ChannelWindowAdjust {
                    recipient_channel: self.remote_id,
                    bytes_to_add,
                };
                if let Err(e) = self.sink.send_payload(adjust.to_bytes()).await {
                    debug!(channel = self.shared.id, error = %e, "Window adjust not sent");
                }
            }
        }
        Some(message)
    }

    /// Sends EOF. Later writes fail.
    pub async fn send_eof(&self) -> FynxResult<()> {
        {
            let mut st = self.shared.lock();
            if st.eof_local || st.close_sent || st.closed {
                return Ok(());
            }
            st.eof_local = true;
        }
        self.shared.notify.notify_waiters();
        self.sink
            .send_payload(encode_channel_only(MessageType::ChannelEof, self.remote_id))
            .await
    }

    /// Sends a channel request. Without `want_reply` the result is `true`
    /// once sent; otherwise it is the peer's answer (`false` if the channel
    /// closes first).
    pub async fn request(&self, name: &str, want_reply: bool, data: &[u8]) -> FynxResult<bool> {
        let _serial = self.shared.request_lock.lock().await;
        let reply = {
            let mut st = self.shared.lock();
            if st.closed || st.close_sent {
                return Err(FynxError::Channel("channel is broken".to_string()));
            }
            if want_reply {
                let (tx, rx) = oneshot::channel();
                st.request_reply = Some(tx);
                Some(rx)
            } else {
                None
            }
        };

        let request = ChannelRequest {
            recipient_channel: self.remote_id,
            request_type: name.to_string(),
            want_reply,
            data: data.to_vec(),
        };
        self.sink.send_payload(request.to_bytes()).await?;

        match reply {
            Some(rx) => Ok(rx.await.unwrap_or(false)),
            None => Ok(true),
        }
    }

    /// Sends CLOSE once; later calls do nothing.
    pub async fn close(&self) -> FynxResult<()> {
        {
            let mut st = self.shared.lock();
            if st.close_sent || st.closed {
                return Ok(());
            }
            st.close_sent = true;
        }
        self.shared.notify.notify_waiters();
        debug!(channel = self.shared.id, "Closing channel");
        self.sink
            .send_payload(encode_channel_only(MessageType::ChannelClose, self.remote_id))
            .await
    }

    /// True once either side closed the channel or the session ended.
    pub fn is_closed(&self) -> bool {
        let st = self.shared.lock();
        st.closed || st.close_sent
    }

    /// True once the peer sent EOF.
    pub fn is_eof(&self) -> bool {
        self.shared.lock().eof_remote
    }

    /// Exit status reported by the peer.
    pub fn exit_status(&self) -> Option<u32> {
        self.shared.lock().exit_status
    }

    /// Bytes we may still send without waiting.
    pub fn remote_window(&self) -> u64 {
        self.shared.lock().remote_window
    }

    /// Bytes the peer may still send us.
    pub fn local_window(&self) -> u32 {
        self.shared.lock().local_window
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("remote_id", &self.remote_id)
            .field("type", &self.shared.channel_type)
            .finish()
    }
}

/// Channels of one session, keyed by local id.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    next_id: u32,
    channels: HashMap<u32, Arc<ChannelShared>>,
}

impl ChannelTable {
    /// Creates and registers a channel with a fresh local id.
    pub(crate) fn create(
        &mut self,
        channel_type: &str,
        local_window_max: u32,
    ) -> (Arc<ChannelShared>, mpsc::UnboundedReceiver<ChannelMessage>) {
        while self.channels.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let (shared, rx) = ChannelShared::new(id, channel_type, local_window_max);
        self.channels.insert(id, shared.clone());
        (shared, rx)
    }

    pub(crate) fn get(&self, id: u32) -> Option<Arc<ChannelShared>> {
        self.channels.get(&id).cloned()
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<Arc<ChannelShared>> {
        self.channels.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }

    /// Empties the table, returning every channel.
    pub(crate) fn drain(&mut self) -> Vec<Arc<ChannelShared>> {
        self.channels.drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::ChannelData;
    use std::time::Duration;

    /// Records every payload handed to the transport.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn send_payload(&self, payload: Vec<u8>) -> FynxResult<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    fn open_channel(window: u32, max_packet: u32) -> (Channel, Arc<ChannelShared>, Arc<RecordingSink>) {
        let mut table = ChannelTable::default();
        let (shared, rx) = table.create("session", DEFAULT_LOCAL_WINDOW);
        shared.confirm_open(77, window, max_packet);
        let sink = Arc::new(RecordingSink::default());
        let channel = Channel::new(shared.clone(), 77, sink.clone(), rx);
        (channel, shared, sink)
    }

    #[tokio::test]
    async fn test_write_splits_to_max_packet() {
        let (channel, _, sink) = open_channel(100_000, 1000);
        channel.write(&[7u8; 2500]).await.unwrap();

        let lens: Vec<usize> = sink
            .sent()
            .iter()
            .map(|p| ChannelData::from_bytes(p).unwrap().data.len())
            .collect();
        assert_eq!(lens, [1000, 1000, 500]);
        assert_eq!(channel.remote_window(), 97_500);
    }

    #[tokio::test]
    async fn test_write_blocks_until_window_adjust() {
        let (channel, shared, sink) = open_channel(40, 1000);
        let writer = tokio::spawn(async move {
            channel.write(&[1u8; 100]).await.map(|_| channel)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.sent().len(), 1);
        assert!(!writer.is_finished());

        shared.add_remote_window(30);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.sent().len(), 2);
        assert!(!writer.is_finished());

        shared.add_remote_window(50);
        let channel = writer.await.unwrap().unwrap();
        // 40 + 30 + 50 - 100
        assert_eq!(channel.remote_window(), 20);
        let total: usize = sink
            .sent()
            .iter()
            .map(|p| ChannelData::from_bytes(p).unwrap().data.len())
            .sum();
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_writer() {
        let (channel, shared, _) = open_channel(0, 1000);
        let channel = Arc::new(channel);
        let writer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.write(b"data").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shared.mark_closed();
        let err = writer.await.unwrap().unwrap_err();
        assert!(err.is_channel_local());
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, shared, sink) = open_channel(10, 10);
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(sink.sent()[0], vec![97, 0, 0, 0, 77]);
        assert!(channel.write(b"x").await.is_err());
        assert_eq!(shared.take_close_reply(), None);
    }

    fn receive(shared: &ChannelShared, len: usize) -> bool {
        let accepted = shared.receive_data(len);
        if accepted {
            shared.deliver(ChannelMessage::Data(vec![0u8; len]));
        }
        accepted
    }

    #[tokio::test]
    async fn test_unread_data_is_bounded_by_local_window() {
        let mut table = ChannelTable::default();
        let (shared, rx) = table.create("session", 1000);
        shared.confirm_open(77, 10, 10);
        let sink = Arc::new(RecordingSink::default());
        let _channel = Channel::new(shared.clone(), 77, sink.clone(), rx);

        let accepted = (0..100).filter(|_| receive(&shared, 600)).count();
        assert_eq!(accepted, 1);
        assert!(receive(&shared, 400));
        assert!(!receive(&shared, 1));
        assert_eq!(shared.lock().local_window, 0);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_local_window_restored_as_data_is_read() {
        let mut table = ChannelTable::default();
        let (shared, rx) = table.create("session", 1000);
        shared.confirm_open(77, 10, 10);
        let sink = Arc::new(RecordingSink::default());
        let mut channel = Channel::new(shared.clone(), 77, sink.clone(), rx);

        assert!(receive(&shared, 400));
        assert!(receive(&shared, 400));
        assert_eq!(channel.local_window(), 200);

        // 200 left is below half: the first read is returned at once.
        assert!(channel.recv().await.is_some());
        assert_eq!(channel.local_window(), 600);
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            ChannelWindowAdjust::from_bytes(&sent[0]).unwrap(),
            ChannelWindowAdjust {
                recipient_channel: 77,
                bytes_to_add: 400
            }
        );

        // Above half: the read is held back.
        assert!(channel.recv().await.is_some());
        assert_eq!(sink.sent().len(), 1);

        assert!(receive(&shared, 200));
        assert!(channel.recv().await.is_some());
        assert_eq!(channel.local_window(), 1000);
        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(ChannelWindowAdjust::from_bytes(&sent[1]).unwrap().bytes_to_add, 600);
    }

    #[tokio::test]
    async fn test_request_reply_and_inbound_events() {
        let (mut channel, shared, sink) = open_channel(10, 10);
        let responder = {
            let shared = shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                shared.resolve_request(true);
            })
        };
        assert!(channel.request("exec", true, b"").await.unwrap());
        responder.await.unwrap();
        assert_eq!(sink.sent()[0][0], 98);

        shared.deliver(ChannelMessage::Data(b"out".to_vec()));
        shared.set_exit_status(3);
        shared.set_eof_remote();
        shared.mark_closed();
        assert_eq!(channel.recv().await, Some(ChannelMessage::Data(b"out".to_vec())));
        assert_eq!(channel.recv().await, Some(ChannelMessage::ExitStatus(3)));
        assert_eq!(channel.recv().await, Some(ChannelMessage::Eof));
        assert_eq!(channel.recv().await, None);
        assert_eq!(channel.exit_status(), Some(3));
        assert!(channel.is_eof());
    }

    #[test]
    fn test_table_ids_are_unique() {
        let mut table = ChannelTable::default();
        let (a, _) = table.create("session", 10);
        let (b, _) = table.create("session", 10);
        assert_ne!(a.id(), b.id());
        assert_eq!(table.len(), 2);
        assert!(table.remove(a.id()).is_some());
        assert!(table.get(a.id()).is_none());
        assert_eq!(table.drain().len(), 1);
    }
}
