//! The session's single reader.
//!
//! Runs from the end of authentication until teardown. Transport messages
//! (including rekeys) go through [`SessionInner::handle_transport`]; the
//! rest is connection protocol traffic handled here. Replies produced while
//! keys are changing are deferred, so this task never waits on its own key
//! exchange.

use super::keepalive::{KeepaliveAction, KeepaliveState};
use super::{lock, SessionInner, StreamReader};
use crate::channel::{Channel, ChannelMessage, ChannelShared};
use crate::connection::{
    encode_channel_only, recipient_channel, ChannelData, ChannelOpen, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelRequest, ChannelWindowAdjust, GlobalRequest, AUTH_AGENT,
    FORWARDED_TCPIP, X11,
};
use crate::message::{disconnect, MessageType, OpenFailureReason};
use crate::wire::Reader;
use fynx_platform::{FynxError, FynxResult};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Dispatch task body: loops until the connection ends, then tears down.
pub(crate) async fn run(inner: Arc<SessionInner>, mut reader: StreamReader) {
    let result = dispatch_loop(&inner, &mut reader).await;
    let err = match result {
        Ok(()) => return,
        Err(e) => e,
    };

    match &err {
        FynxError::Disconnected {
            reason,
            description,
        } => inner.teardown(*reason, description).await,
        FynxError::MacMismatch { .. } => {
            error!(error = %err, "Closing session");
            inner.close_with(disconnect::MAC_ERROR, &err.to_string()).await;
        }
        FynxError::Protocol(_) | FynxError::Negotiation(_) | FynxError::Security(_) => {
            error!(error = %err, "Closing session");
            inner.close_with(disconnect::PROTOCOL_ERROR, &err.to_string()).await;
        }
        FynxError::HostKeyRejected(_) => {
            error!(error = %err, "Closing session");
            inner
                .close_with(disconnect::HOST_KEY_NOT_VERIFIABLE, &err.to_string())
                .await;
        }
        _ => {
            info!(error = %err, "Connection lost");
            inner.teardown(disconnect::CONNECTION_LOST, &err.to_string()).await;
        }
    }
}

async fn dispatch_loop(inner: &Arc<SessionInner>, reader: &mut StreamReader) -> FynxResult<()> {
    let mut deferred: Vec<Vec<u8>> = Vec::new();
    let mut keepalive = KeepaliveState::new(inner.config.server_alive_count_max);
    let read_timeout = inner.config.read_timeout();

    loop {
        let read = reader.read_packet();
        let payload = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(payload) => payload?,
                Err(_) => {
                    match keepalive.on_timeout(inner.in_kex()) {
                        KeepaliveAction::Probe => {
                            debug!(misses = keepalive.misses(), "Read timed out, probing");
                            inner.probe().await?
                        }
                        KeepaliveAction::Wait => {}
                        KeepaliveAction::Dead => {
                            return Err(FynxError::Timeout(format!(
                                "no reply to {} keep-alive probes",
                                keepalive.misses()
                            )))
                        }
                    }
                    if rekey_due(inner, reader.bytes_since_rekey()).await {
                        debug!("Rekey limit reached while idle");
                        inner.start_kex().await?;
                    }
                    continue;
                }
            },
            None => read.await?,
        };
        keepalive.reset();

        if let Some(payload) = inner.handle_transport(reader, payload, &mut deferred).await? {
            handle_connection_message(inner, payload, &mut deferred).await?;
        }

        if rekey_due(inner, reader.bytes_since_rekey()).await {
            debug!("Rekey limit reached");
            inner.start_kex().await?;
        }
    }
}

/// `received` is taken by value: the reader's algorithm state is not `Sync`.
async fn rekey_due(inner: &SessionInner, received: u64) -> bool {
    if inner.in_kex() {
        return false;
    }
    let sent = inner
        .writer
        .lock()
        .await
        .as_ref()
        .map_or(0, |w| w.bytes_since_rekey());
    if sent.max(received) >= inner.config.rekey_bytes_limit {
        return true;
    }
    match inner.config.rekey_time_limit {
        Some(limit) => lock(&inner.last_kex).elapsed() >= limit,
        None => false,
    }
}

async fn handle_connection_message(
    inner: &Arc<SessionInner>,
    payload: Vec<u8>,
    deferred: &mut Vec<Vec<u8>>,
) -> FynxResult<()> {
    let msg = payload[0];
    let Some(kind) = MessageType::from_u8(msg) else {
        return Err(FynxError::Protocol(format!("Unknown SSH message type {}", msg)));
    };

    match kind {
        MessageType::GlobalRequest => {
            let request = GlobalRequest::from_bytes(&payload)?;
            debug!(name = %request.name, "Refusing global request");
            if request.want_reply {
                inner
                    .write_or_defer(vec![MessageType::RequestFailure as u8], deferred)
                    .await?;
            }
        }
        MessageType::RequestSuccess | MessageType::RequestFailure => {
            let waiter = lock(&inner.global_replies).pop_front();
            let reply = (kind == MessageType::RequestSuccess).then(|| payload[1..].to_vec());
            match waiter {
                Some(Some(tx)) => {
                    let _ = tx.send(reply);
                }
                Some(None) => trace!("Keep-alive reply"),
                None => debug!(msg, "Global request reply without a request"),
            }
        }
        MessageType::ChannelOpen => handle_peer_open(inner, &payload, deferred).await?,
        MessageType::ChannelOpenConfirmation => {
            let confirm = ChannelOpenConfirmation::from_bytes(&payload)?;
            match lookup(inner, confirm.recipient_channel) {
                Some(channel) => channel.confirm_open(
                    confirm.sender_channel,
                    confirm.initial_window_size,
                    confirm.maximum_packet_size,
                ),
                None => debug!(channel = confirm.recipient_channel, "Confirmation for unknown channel"),
            }
        }
        MessageType::ChannelOpenFailure => {
            let failure = ChannelOpenFailure::from_bytes(&payload)?;
            let removed = lock(&inner.channels).remove(failure.recipient_channel);
            if let Some(channel) = removed {
                let reason = OpenFailureReason::from_u32(failure.reason_code)
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_else(|| failure.reason_code.to_string());
                debug!(channel = channel.id(), reason = %reason, "Channel open refused");
                channel.fail_open(failure.reason_code, &failure.description);
            }
        }
        MessageType::ChannelWindowAdjust => {
            let adjust = ChannelWindowAdjust::from_bytes(&payload)?;
            if let Some(channel) = lookup(inner, adjust.recipient_channel) {
                channel.add_remote_window(adjust.bytes_to_add);
            }
        }
        MessageType::ChannelData | MessageType::ChannelExtendedData => {
            let data = ChannelData::from_bytes(&payload)?;
            let Some(channel) = lookup(inner, data.recipient_channel) else {
                debug!(channel = data.recipient_channel, "Data for unknown channel");
                return Ok(());
            };
            let len = data.data.len();
            if !channel.receive_data(len) {
                warn!(channel = channel.id(), len, "Data exceeds local window, dropped");
                return Ok(());
            }
            trace!(channel = channel.id(), len, "Channel data");
            channel.deliver(match data.data_type {
                None => ChannelMessage::Data(data.data),
                Some(code) => ChannelMessage::ExtendedData(code, data.data),
            });
        }
        MessageType::ChannelEof => {
            if let Some(channel) = lookup(inner, recipient_channel(&payload)?) {
                debug!(channel = channel.id(), "Peer sent EOF");
                channel.set_eof_remote();
            }
        }
        MessageType::ChannelClose => {
            let id = recipient_channel(&payload)?;
            let removed = lock(&inner.channels).remove(id);
            let Some(channel) = removed else {
                return Ok(());
            };
            if let Some(remote) = channel.take_close_reply() {
                inner
                    .write_or_defer(encode_channel_only(MessageType::ChannelClose, remote), deferred)
                    .await?;
            }
            channel.mark_closed();
            debug!(channel = id, "Channel closed");
        }
        MessageType::ChannelRequest => {
            let request = ChannelRequest::from_bytes(&payload)?;
            let Some(channel) = lookup(inner, request.recipient_channel) else {
                return Ok(());
            };
            let mut reply = MessageType::ChannelFailure;
            if request.request_type == "exit-status" {
                let status = Reader::new(&request.data).u32()?;
                debug!(channel = channel.id(), status, "Exit status");
                channel.set_exit_status(status);
                reply = MessageType::ChannelSuccess;
            } else {
                debug!(channel = channel.id(), request = %request.request_type, "Channel request");
            }
            if request.want_reply {
                if let Some(remote) = channel.remote_id() {
                    inner
                        .write_or_defer(encode_channel_only(reply, remote), deferred)
                        .await?;
                }
            }
        }
        MessageType::ChannelSuccess | MessageType::ChannelFailure => {
            if let Some(channel) = lookup(inner, recipient_channel(&payload)?) {
                channel.resolve_request(kind == MessageType::ChannelSuccess);
            }
        }
        other => {
            return Err(FynxError::Protocol(format!(
                "Unexpected message {} after authentication",
                other
            )))
        }
    }
    Ok(())
}

fn lookup(inner: &SessionInner, id: u32) -> Option<Arc<ChannelShared>> {
    lock(&inner.channels).get(id)
}

fn open_allowed(inner: &SessionInner, channel_type: &str) -> bool {
    channel_type == FORWARDED_TCPIP
        || (channel_type == X11 && inner.config.x11_forwarding)
        || (channel_type == AUTH_AGENT && inner.config.agent_forwarding)
}

/// Peer CHANNEL_OPEN: allow-listed types with a handler are accepted and
/// served on their own task, the rest refused.
async fn handle_peer_open(
    inner: &Arc<SessionInner>,
    payload: &[u8],
    deferred: &mut Vec<Vec<u8>>,
) -> FynxResult<()> {
    let open = ChannelOpen::from_bytes(payload)?;

    let refuse = |reason: OpenFailureReason| {
        let mut failure = ChannelOpenFailure::new(open.sender_channel, reason as u32);
        failure.description = reason.as_str().to_string();
        failure.to_bytes()
    };

    if !open_allowed(inner, &open.channel_type) {
        warn!(channel_type = %open.channel_type, "Refusing channel open");
        return inner
            .write_or_defer(refuse(OpenFailureReason::AdministrativelyProhibited), deferred)
            .await;
    }
    let Some(handler) = inner.open_handlers.get(&open.channel_type).cloned() else {
        warn!(channel_type = %open.channel_type, "No handler for channel type");
        return inner
            .write_or_defer(refuse(OpenFailureReason::ConnectFailed), deferred)
            .await;
    };

    let window = inner.config.local_window_max;
    let max_packet = inner.config.local_max_packet;
    let (shared, rx) = lock(&inner.channels).create(&open.channel_type, window);
    shared.confirm_open(
        open.sender_channel,
        open.initial_window_size,
        open.maximum_packet_size,
    );
    let confirmation = ChannelOpenConfirmation {
        recipient_channel: open.sender_channel,
        sender_channel: shared.id(),
        initial_window_size: window,
        maximum_packet_size: max_packet,
    };
    inner.write_or_defer(confirmation.to_bytes(), deferred).await?;
    info!(
        channel = shared.id(),
        channel_type = %open.channel_type,
        "Accepted channel from peer"
    );

    let channel = Channel::new(shared, open.sender_channel, inner.clone(), rx);
    tokio::spawn(async move { handler.handle(channel, open).await });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn require_send<T: Send>(_: &T) {}

    // Compile-time check: the loop must be spawnable on the multi-threaded runtime.
    #[allow(dead_code)]
    fn dispatch_task_is_send(inner: Arc<SessionInner>, reader: StreamReader) {
        let task = run(inner, reader);
        require_send(&task);
    }
}
