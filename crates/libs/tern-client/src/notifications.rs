//! Server-push handling.
//!
//! Pushed frames flow through one ordered loop (the orchestrator's push
//! context) so cache mutations driven by notifications never interleave out
//! of arrival order.

use std::sync::Weak;

use tokio::sync::mpsc;

use tern_cache::{LastMessageSummary, SnapshotPatch};
use tern_wire::command::{
    self, ConvNotifyPayload, ConvOp, GoawayPayload, MessageItem, MessageNotifyPayload,
    SessionClosedPayload, UnreadNotifyPayload,
};
use tern_wire::{Frame, Opcode};

use crate::client::ClientCore;
use crate::error::ClientError;
use crate::session::SessionStatus;

pub(crate) async fn run_notifications(
    core: Weak<ClientCore>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = frames.recv().await {
        let Some(core) = core.upgrade() else { return };
        core.handle_push(frame).await;
    }
}

pub(crate) fn last_message_summary(message: &MessageItem) -> LastMessageSummary {
    LastMessageSummary {
        message_id: message.message_id.clone(),
        from: message.from.clone(),
        text: message.body.clone(),
        mention_all: message.mention_all,
        mention_ids: message.mention_ids.clone(),
        timestamp: message.timestamp,
    }
}

impl ClientCore {
    pub(crate) async fn handle_push(&self, frame: Frame) {
        match frame.opcode {
            Opcode::MessageNotify => match command::decode_payload::<MessageNotifyPayload>(
                &frame.payload,
            ) {
                Ok(payload) => self.on_message_notify(payload).await,
                Err(err) => log::warn!("client: bad message notify: {err}"),
            },
            Opcode::ConvNotify => {
                match command::decode_payload::<ConvNotifyPayload>(&frame.payload) {
                    Ok(payload) => self.on_conv_notify(payload).await,
                    Err(err) => log::warn!("client: bad conversation notify: {err}"),
                }
            }
            Opcode::UnreadNotify => {
                match command::decode_payload::<UnreadNotifyPayload>(&frame.payload) {
                    Ok(payload) => self.on_unread_notify(payload).await,
                    Err(err) => log::warn!("client: bad unread notify: {err}"),
                }
            }
            Opcode::Goaway => {
                let reason = command::decode_payload::<GoawayPayload>(&frame.payload)
                    .ok()
                    .and_then(|payload| payload.reason)
                    .unwrap_or_default();
                log::info!("client: server goaway ({reason}), cycling connection");
                self.connection.cycle().await;
            }
            Opcode::SessionClosed => self.on_session_closed(frame).await,
            other => log::debug!("client: unhandled push {other:?}"),
        }
    }

    async fn on_message_notify(&self, payload: MessageNotifyPayload) {
        if !payload.transient {
            if let Some(cache) = &self.cache {
                match cache.get(&payload.conversation_id).await {
                    Ok(Some(snapshot)) => {
                        let unread = if payload.message.from == self.client_id {
                            snapshot.unread_count
                        } else {
                            snapshot.unread_count.saturating_add(1)
                        };
                        let patch = SnapshotPatch {
                            last_message: Some(last_message_summary(&payload.message)),
                            unread_count: Some(unread),
                            updated_at: Some(payload.message.timestamp),
                            ..SnapshotPatch::default()
                        };
                        if let Err(err) = cache.update(&payload.conversation_id, &patch).await {
                            log::warn!("client: cache update failed: {err}");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!("client: cache read failed: {err}"),
                }
            }
        }
        self.delegate.did_receive_message(&payload.conversation_id, &payload.message).await;
    }

    async fn on_conv_notify(&self, payload: ConvNotifyPayload) {
        if let Some(cache) = &self.cache {
            let result = match payload.op {
                ConvOp::Joined | ConvOp::MembersJoined => {
                    let patch = SnapshotPatch {
                        members_joined: payload.member_ids.clone(),
                        updated_at: Some(payload.timestamp),
                        ..SnapshotPatch::default()
                    };
                    cache.update(&payload.conversation_id, &patch).await
                }
                ConvOp::Left | ConvOp::MembersLeft => {
                    let patch = SnapshotPatch {
                        members_left: payload.member_ids.clone(),
                        updated_at: Some(payload.timestamp),
                        ..SnapshotPatch::default()
                    };
                    cache.update(&payload.conversation_id, &patch).await
                }
                ConvOp::MembersMuted => {
                    let patch = SnapshotPatch {
                        muted_added: payload.member_ids.clone(),
                        updated_at: Some(payload.timestamp),
                        ..SnapshotPatch::default()
                    };
                    cache.update(&payload.conversation_id, &patch).await
                }
                ConvOp::MembersUnmuted => {
                    let patch = SnapshotPatch {
                        muted_removed: payload.member_ids.clone(),
                        updated_at: Some(payload.timestamp),
                        ..SnapshotPatch::default()
                    };
                    cache.update(&payload.conversation_id, &patch).await
                }
                ConvOp::MembersBlocked | ConvOp::MembersUnblocked => {
                    // Block state is server-side; only the freshness stamp
                    // moves locally.
                    let patch = SnapshotPatch {
                        updated_at: Some(payload.timestamp),
                        ..SnapshotPatch::default()
                    };
                    cache.update(&payload.conversation_id, &patch).await
                }
                ConvOp::Updated => {
                    // The push does not carry the new state; the cached
                    // snapshot is stale until the next authoritative fetch.
                    cache
                        .set_should_fetch(&payload.conversation_id, true)
                        .await
                        .map(|_| ())
                }
            };
            match result {
                Ok(()) => {}
                Err(tern_cache::CacheError::NotFound(_)) => {}
                Err(err) => log::warn!("client: cache update failed: {err}"),
            }
        }
        self.delegate.conversation_event(&payload.conversation_id, &payload).await;
    }

    async fn on_unread_notify(&self, payload: UnreadNotifyPayload) {
        if let Some(cache) = &self.cache {
            for entry in &payload.entries {
                let patch = SnapshotPatch {
                    last_message: entry.last_message.as_ref().map(last_message_summary),
                    unread_count: Some(entry.unread_count),
                    ..SnapshotPatch::default()
                };
                match cache.update(&entry.conversation_id, &patch).await {
                    Ok(()) => {}
                    Err(tern_cache::CacheError::NotFound(_)) => {}
                    Err(err) => log::warn!("client: cache update failed: {err}"),
                }
            }
        }
        self.delegate.did_update_unread(&payload.entries).await;
    }

    async fn on_session_closed(&self, frame: Frame) {
        let payload =
            command::decode_payload::<SessionClosedPayload>(&frame.payload).unwrap_or_default();
        let mut state = self.state.lock().await;
        if state.status != SessionStatus::Opened {
            return;
        }
        state.status = SessionStatus::Closed;
        state.token = None;
        drop(state);
        self.connection.disconnect().await;
        let error = ClientError::Rejected {
            code: payload.code.unwrap_or_default(),
            reason: payload.reason.unwrap_or_else(|| "session closed by server".to_owned()),
        };
        log::info!("client: session closed by server: {error}");
        self.delegate.did_close(error).await;
    }
}
