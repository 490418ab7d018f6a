//! The client orchestrator.
//!
//! One FIFO-fair mutex serializes every externally triggered operation, so
//! concurrent callers never interleave session-level mutations. The client
//! implements the connection delegate through a weak bridge: the connection
//! never extends the client's lifetime, and callbacks re-enter through
//! id-based lookup rather than ownership.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex};

use tern_cache::{store_path, CacheError, ConversationCache, ConversationSnapshot, SnapshotPatch};
use tern_connection::{
    AlwaysForeground, AlwaysReachable, AppLifecycleSource, Connection, ConnectionConfig,
    ConnectionDelegate, ConnectionEvent, ConnectionState, FrameTransport, ReachabilitySource,
    DEFAULT_COMMAND_TTL,
};
use tern_wire::command::{
    self, ConvCreatePayload, ConvCreatedPayload, ConvItem, ConvQueryPayload,
    ConvQueryResultPayload, ErrorPayload, IntervalBound, MembersPayload, MembersResultPayload,
    MessageItem, MessageQueryPayload, MessageQueryResultPayload, MessageReadDonePayload,
    MessageReadPayload, MessageSendPayload, MessageSentPayload, QueryDirection,
    SessionClosePayload, SessionClosedPayload, SessionOpenPayload, SessionOpenedPayload,
};
use tern_wire::{Frame, Opcode, ProtocolVariant};

use crate::delegate::{ClientDelegate, NoopClientDelegate};
use crate::error::ClientError;
use crate::notifications::{last_message_summary, run_notifications};
use crate::session::{
    now_ms, valid_client_id, SessionStatus, SessionToken, KV_SESSION_TOKEN, RESERVED_TAG,
};
use crate::signature::{NoSignature, SignatureAction, SignatureSource};

/// Where conversation snapshots are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheOption {
    /// Application-scoped sqlite file under the platform data directory.
    #[default]
    OnDisk,
    /// In-memory store; state does not survive the process.
    InMemory,
    /// No conversation cache at all.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenOption {
    /// Open, kicking any other device holding the same client id + tag.
    #[default]
    Default,
    /// Open only if the server still holds this client's session.
    Reopen,
}

/// Per-message send options.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub mention_all: bool,
    pub mention_ids: Vec<String>,
    /// Transient messages are not persisted and never become a
    /// conversation's last message.
    pub transient: bool,
}

pub struct ClientConfig {
    pub app_id: String,
    pub client_id: String,
    pub tag: Option<String>,
    pub transport: Arc<dyn FrameTransport>,
    pub delegate: Arc<dyn ClientDelegate>,
    pub signature_source: Arc<dyn SignatureSource>,
    pub reachability: Arc<dyn ReachabilitySource>,
    pub lifecycle: Arc<dyn AppLifecycleSource>,
    /// Negotiate `tern.rtm.3` so the server pushes unread counts.
    pub use_unread: bool,
    pub command_ttl: Duration,
    pub cache: CacheOption,
}

impl ClientConfig {
    pub fn new(
        app_id: impl Into<String>,
        client_id: impl Into<String>,
        transport: Arc<dyn FrameTransport>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            client_id: client_id.into(),
            tag: None,
            transport,
            delegate: Arc::new(NoopClientDelegate),
            signature_source: Arc::new(NoSignature),
            reachability: Arc::new(AlwaysReachable::default()),
            lifecycle: Arc::new(AlwaysForeground::default()),
            use_unread: true,
            command_ttl: DEFAULT_COMMAND_TTL,
            cache: CacheOption::default(),
        }
    }
}

pub(crate) struct ClientState {
    pub(crate) status: SessionStatus,
    pub(crate) token: Option<SessionToken>,
}

pub(crate) struct ClientCore {
    pub(crate) client_id: String,
    pub(crate) tag: Option<String>,
    pub(crate) variant: ProtocolVariant,
    pub(crate) connection: Connection,
    pub(crate) cache: Option<ConversationCache>,
    pub(crate) delegate: Arc<dyn ClientDelegate>,
    pub(crate) signature_source: Arc<dyn SignatureSource>,
    pub(crate) state: Mutex<ClientState>,
    pub(crate) command_ttl: Duration,
    resuming: AtomicBool,
    notifications_tx: mpsc::UnboundedSender<Frame>,
}

/// An RTM client. Cloning shares the same session; must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

struct ConnectionBridge {
    core: Weak<ClientCore>,
}

#[async_trait]
impl ConnectionDelegate for ConnectionBridge {
    async fn did_connect(&self) {
        let Some(core) = self.core.upgrade() else { return };
        if core.resuming.swap(false, Ordering::SeqCst) {
            tokio::spawn(async move {
                core.resume_session().await;
            });
        }
    }

    async fn failed_connecting(&self, event: ConnectionEvent) {
        log::debug!("client: connect attempt failed: {event}");
    }

    async fn did_disconnect(&self, event: ConnectionEvent) {
        if event == ConnectionEvent::DisconnectInvoked {
            return;
        }
        let Some(core) = self.core.upgrade() else { return };
        let status = core.state.lock().await.status;
        if status == SessionStatus::Opened {
            core.resuming.store(true, Ordering::SeqCst);
            core.delegate.did_pause(event).await;
        }
    }

    async fn received_frame(&self, frame: Frame) {
        let Some(core) = self.core.upgrade() else { return };
        let _ = core.notifications_tx.send(frame);
    }

    async fn protocol_error(&self, reason: String) {
        log::warn!("client: protocol error reported: {reason}");
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if !valid_client_id(&config.client_id) {
            return Err(ClientError::InvalidClientId);
        }
        if config.tag.as_deref() == Some(RESERVED_TAG) {
            return Err(ClientError::InvalidTag);
        }

        let cache = match config.cache {
            CacheOption::OnDisk => {
                let path = store_path(&config.app_id, &config.client_id)?;
                Some(ConversationCache::open(&path)?)
            }
            CacheOption::InMemory => Some(ConversationCache::in_memory()?),
            CacheOption::Disabled => None,
        };

        let variant = if config.use_unread { ProtocolVariant::V3 } else { ProtocolVariant::V1 };

        let core = Arc::new_cyclic(|weak: &Weak<ClientCore>| {
            let bridge = Arc::new(ConnectionBridge { core: weak.clone() });
            let mut connection_config = ConnectionConfig::new(config.transport, bridge);
            connection_config.variant = variant;
            connection_config.command_ttl = config.command_ttl;
            connection_config.reachability = config.reachability;
            connection_config.lifecycle = config.lifecycle;
            let connection = Connection::new(connection_config);

            let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_notifications(weak.clone(), notifications_rx));

            ClientCore {
                client_id: config.client_id,
                tag: config.tag,
                variant,
                connection,
                cache,
                delegate: config.delegate,
                signature_source: config.signature_source,
                state: Mutex::new(ClientState { status: SessionStatus::Closed, token: None }),
                command_ttl: config.command_ttl,
                resuming: AtomicBool::new(false),
                notifications_tx,
            }
        });

        Ok(Self { core })
    }

    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    pub fn tag(&self) -> Option<&str> {
        self.core.tag.as_deref()
    }

    pub async fn status(&self) -> SessionStatus {
        self.core.state.lock().await.status
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.connection.state()
    }

    /// The conversation cache, when enabled. Queries run on the cache's own
    /// serial context and may be issued from any task.
    pub fn cache(&self) -> Option<&ConversationCache> {
        self.core.cache.as_ref()
    }

    /// Open the session: connect, obtain a session token (cached or freshly
    /// signed), and log in. On auth rejection of a cached token the open is
    /// retried exactly once with a forced-refresh signature.
    pub async fn open(&self, option: OpenOption) -> Result<(), ClientError> {
        let core = &self.core;
        let mut state = core.state.lock().await;
        match state.status {
            SessionStatus::Opened => return Ok(()),
            SessionStatus::Opening | SessionStatus::Closing => {
                return Err(ClientError::InvalidState {
                    expected: "closed",
                    actual: state.status.as_str(),
                })
            }
            SessionStatus::Closed => {}
        }
        state.status = SessionStatus::Opening;

        if state.token.is_none() {
            state.token = core.load_persisted_token().await;
        }

        core.connection.connect().await;
        if let Err(err) = core.wait_connected().await {
            state.status = SessionStatus::Closed;
            core.connection.disconnect().await;
            return Err(err);
        }

        match core.open_session(&mut state, matches!(option, OpenOption::Reopen)).await {
            Ok(_) => {
                state.status = SessionStatus::Opened;
                Ok(())
            }
            Err(err) => {
                state.status = SessionStatus::Closed;
                core.connection.disconnect().await;
                Err(err)
            }
        }
    }

    /// Close the session. The session-close command is best-effort; the
    /// explicit disconnect resolves anything still pending with `Cancelled`.
    pub async fn close(&self) -> Result<(), ClientError> {
        let core = &self.core;
        let mut state = core.state.lock().await;
        match state.status {
            SessionStatus::Closed => {
                core.connection.disconnect().await;
                return Ok(());
            }
            SessionStatus::Opening | SessionStatus::Closing => {
                return Err(ClientError::InvalidState {
                    expected: "opened",
                    actual: state.status.as_str(),
                })
            }
            SessionStatus::Opened => {}
        }
        state.status = SessionStatus::Closing;

        let payload = command::encode_payload(&SessionClosePayload {})
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        match core.command(Opcode::SessionClose, payload).await {
            Ok(frame) => {
                if let Err(err) =
                    expect_response::<SessionClosedPayload>(frame, Opcode::SessionClosed)
                {
                    log::debug!("client: session close rejected: {err}");
                }
            }
            Err(err) => log::debug!("client: session close not delivered: {err}"),
        }

        core.connection.disconnect().await;
        state.status = SessionStatus::Closed;
        Ok(())
    }

    /// The current session token. Absent/expired tokens, or `force_refresh`,
    /// trigger a refresh round-trip that caches and persists a new one.
    pub async fn get_session_token(&self, force_refresh: bool) -> Result<String, ClientError> {
        let core = &self.core;
        let mut state = core.state.lock().await;
        if state.status != SessionStatus::Opened {
            return Err(ClientError::InvalidState {
                expected: "opened",
                actual: state.status.as_str(),
            });
        }
        if force_refresh {
            state.token = None;
        } else if let Some(token) = state.token.as_ref().filter(|t| !t.is_expired(now_ms())) {
            return Ok(token.token.clone());
        }
        let opened = core.open_session(&mut state, true).await?;
        Ok(opened.session_token)
    }

    /// Create a conversation. The caller is always a member. With `unique`
    /// the server reuses an existing conversation with the identical member
    /// set.
    pub async fn create_conversation(
        &self,
        members: BTreeSet<String>,
        unique: bool,
        name: Option<String>,
        attributes: Option<JsonValue>,
    ) -> Result<ConversationSnapshot, ClientError> {
        let core = &self.core;
        let state = core.state.lock().await;
        ensure_opened(&state)?;

        let mut members = members;
        members.insert(core.client_id.clone());
        let target_ids: Vec<String> = members.iter().cloned().collect();
        let signature = core
            .signature_source
            .signature(&core.client_id, None, SignatureAction::Create, &target_ids)
            .await?;

        let payload = ConvCreatePayload {
            members: members.clone(),
            unique,
            name: name.clone(),
            attributes: attributes.clone(),
            signature: signature.map(Into::into),
        };
        let frame = core.command(Opcode::ConvCreate, encode(&payload)?).await?;
        let created: ConvCreatedPayload = expect_response(frame, Opcode::ConvCreated)?;

        let mut snapshot = ConversationSnapshot::new(created.conversation_id);
        snapshot.name = name;
        snapshot.creator = Some(core.client_id.clone());
        snapshot.members = members;
        snapshot.attributes = attributes;
        snapshot.created_at = created.created_at;
        snapshot.updated_at = created.created_at;
        if let Some(cache) = &core.cache {
            cache.insert_or_replace(&snapshot).await?;
        }
        Ok(snapshot)
    }

    /// Authoritative fetch of one conversation. Upserts the snapshot with the
    /// staleness flag cleared for exactly this conversation.
    pub async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationSnapshot, ClientError> {
        let core = &self.core;
        let state = core.state.lock().await;
        ensure_opened(&state)?;

        let payload = ConvQueryPayload { conversation_ids: vec![conversation_id.to_owned()] };
        let frame = core.command(Opcode::ConvQuery, encode(&payload)?).await?;
        let result: ConvQueryResultPayload = expect_response(frame, Opcode::ConvQueryResult)?;
        let item = result.conversations.into_iter().next().ok_or(ClientError::Rejected {
            code: command::code::CONVERSATION_NOT_FOUND,
            reason: format!("conversation {conversation_id} not found"),
        })?;

        let snapshot = snapshot_from_item(item);
        if let Some(cache) = &core.cache {
            cache.insert_or_replace(&snapshot).await?;
        }
        Ok(snapshot)
    }

    pub async fn add_members(
        &self,
        conversation_id: &str,
        member_ids: BTreeSet<String>,
    ) -> Result<(), ClientError> {
        self.members_op(conversation_id, member_ids, MembersOp::Add).await
    }

    pub async fn remove_members(
        &self,
        conversation_id: &str,
        member_ids: BTreeSet<String>,
    ) -> Result<(), ClientError> {
        self.members_op(conversation_id, member_ids, MembersOp::Remove).await
    }

    pub async fn mute_members(
        &self,
        conversation_id: &str,
        member_ids: BTreeSet<String>,
    ) -> Result<(), ClientError> {
        self.members_op(conversation_id, member_ids, MembersOp::Mute).await
    }

    pub async fn unmute_members(
        &self,
        conversation_id: &str,
        member_ids: BTreeSet<String>,
    ) -> Result<(), ClientError> {
        self.members_op(conversation_id, member_ids, MembersOp::Unmute).await
    }

    pub async fn block_members(
        &self,
        conversation_id: &str,
        member_ids: BTreeSet<String>,
    ) -> Result<(), ClientError> {
        self.members_op(conversation_id, member_ids, MembersOp::Block).await
    }

    pub async fn unblock_members(
        &self,
        conversation_id: &str,
        member_ids: BTreeSet<String>,
    ) -> Result<(), ClientError> {
        self.members_op(conversation_id, member_ids, MembersOp::Unblock).await
    }

    /// Send a message. Non-transient sends refresh the cached last-message
    /// summary.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        body: impl Into<String>,
        options: MessageOptions,
    ) -> Result<MessageItem, ClientError> {
        let core = &self.core;
        let state = core.state.lock().await;
        ensure_opened(&state)?;

        let body = body.into();
        let payload = MessageSendPayload {
            conversation_id: conversation_id.to_owned(),
            body: body.clone(),
            mention_all: options.mention_all,
            mention_ids: options.mention_ids.clone(),
            transient: options.transient,
        };
        let frame = core.command(Opcode::MessageSend, encode(&payload)?).await?;
        let sent: MessageSentPayload = expect_response(frame, Opcode::MessageSent)?;

        let message = MessageItem {
            message_id: sent.message_id,
            from: core.client_id.clone(),
            timestamp: sent.timestamp,
            body,
            mention_all: options.mention_all,
            mention_ids: options.mention_ids,
        };
        if !options.transient {
            if let Some(cache) = &core.cache {
                let patch = SnapshotPatch {
                    last_message: Some(last_message_summary(&message)),
                    updated_at: Some(message.timestamp),
                    ..SnapshotPatch::default()
                };
                match cache.update(conversation_id, &patch).await {
                    Ok(()) | Err(CacheError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(message)
    }

    /// Query message history anchored by interval bounds.
    ///
    /// Bounds must reference `(message_id, timestamp)` pairs of messages that
    /// actually exist; a mismatched pair yields undefined continuity. Results
    /// come back ordered strictly by timestamp, ties broken by message id.
    pub async fn query_messages(
        &self,
        conversation_id: &str,
        start: Option<IntervalBound>,
        end: Option<IntervalBound>,
        direction: QueryDirection,
        limit: u16,
    ) -> Result<Vec<MessageItem>, ClientError> {
        let core = &self.core;
        let state = core.state.lock().await;
        ensure_opened(&state)?;

        let payload = MessageQueryPayload {
            conversation_id: conversation_id.to_owned(),
            start,
            end,
            direction,
            limit,
        };
        let frame = core.command(Opcode::MessageQuery, encode(&payload)?).await?;
        let result: MessageQueryResultPayload =
            expect_response(frame, Opcode::MessageQueryResult)?;
        Ok(result.messages)
    }

    /// Mark the conversation read up to its cached last message and reset the
    /// local unread count.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<(), ClientError> {
        let core = &self.core;
        let state = core.state.lock().await;
        ensure_opened(&state)?;

        let last = match &core.cache {
            Some(cache) => {
                cache.get(conversation_id).await?.and_then(|snapshot| snapshot.last_message)
            }
            None => None,
        };
        let payload = MessageReadPayload {
            conversation_id: conversation_id.to_owned(),
            message_id: last.as_ref().map(|message| message.message_id.clone()),
            timestamp: last.as_ref().map(|message| message.timestamp).unwrap_or_else(now_ms),
        };
        let frame = core.command(Opcode::MessageRead, encode(&payload)?).await?;
        let _: MessageReadDonePayload = expect_response(frame, Opcode::MessageReadDone)?;

        if let Some(cache) = &core.cache {
            let patch =
                SnapshotPatch { unread_count: Some(0), ..SnapshotPatch::default() };
            match cache.update(conversation_id, &patch).await {
                Ok(()) | Err(CacheError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn members_op(
        &self,
        conversation_id: &str,
        member_ids: BTreeSet<String>,
        op: MembersOp,
    ) -> Result<(), ClientError> {
        let core = &self.core;
        let state = core.state.lock().await;
        ensure_opened(&state)?;

        let target_ids: Vec<String> = member_ids.iter().cloned().collect();
        let signature = match op.signature_action() {
            Some(action) => {
                core.signature_source
                    .signature(&core.client_id, Some(conversation_id), action, &target_ids)
                    .await?
            }
            None => None,
        };

        let payload = MembersPayload {
            conversation_id: conversation_id.to_owned(),
            member_ids,
            signature: signature.map(Into::into),
        };
        let (request, response) = op.opcodes();
        let frame = core.command(request, encode(&payload)?).await?;
        let result: MembersResultPayload = expect_response(frame, response)?;

        if let Some(cache) = &core.cache {
            let mut patch =
                SnapshotPatch { updated_at: Some(result.updated_at), ..SnapshotPatch::default() };
            match op {
                MembersOp::Add => patch.members_joined = result.member_ids,
                MembersOp::Remove => patch.members_left = result.member_ids,
                MembersOp::Mute => patch.muted_added = result.member_ids,
                MembersOp::Unmute => patch.muted_removed = result.member_ids,
                // Block state lives server-side only.
                MembersOp::Block | MembersOp::Unblock => {}
            }
            match cache.update(conversation_id, &patch).await {
                Ok(()) | Err(CacheError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum MembersOp {
    Add,
    Remove,
    Mute,
    Unmute,
    Block,
    Unblock,
}

impl MembersOp {
    fn opcodes(self) -> (Opcode, Opcode) {
        match self {
            Self::Add => (Opcode::MembersAdd, Opcode::MembersAdded),
            Self::Remove => (Opcode::MembersRemove, Opcode::MembersRemoved),
            Self::Mute => (Opcode::MembersMute, Opcode::MembersMuted),
            Self::Unmute => (Opcode::MembersUnmute, Opcode::MembersUnmuted),
            Self::Block => (Opcode::MembersBlock, Opcode::MembersBlocked),
            Self::Unblock => (Opcode::MembersUnblock, Opcode::MembersUnblocked),
        }
    }

    fn signature_action(self) -> Option<SignatureAction> {
        match self {
            Self::Add => Some(SignatureAction::Invite),
            Self::Remove => Some(SignatureAction::Kick),
            Self::Block => Some(SignatureAction::Block),
            Self::Unblock => Some(SignatureAction::Unblock),
            Self::Mute | Self::Unmute => None,
        }
    }
}

impl ClientCore {
    pub(crate) async fn command(
        &self,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<Frame, ClientError> {
        Ok(self.connection.send_command(opcode, payload).await?)
    }

    async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut watch = self.connection.state_watch();
        let wait = async {
            loop {
                if *watch.borrow() == ConnectionState::Connected {
                    return;
                }
                if watch.changed().await.is_err() {
                    return;
                }
            }
        };
        match tokio::time::timeout(self.command_ttl, wait).await {
            Ok(()) if self.connection.state() == ConnectionState::Connected => Ok(()),
            Ok(()) => Err(ClientError::Transport("connection closed".to_owned())),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn load_persisted_token(&self) -> Option<SessionToken> {
        let cache = self.cache.as_ref()?;
        match cache.kv_get(KV_SESSION_TOKEN).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                log::warn!("client: persisted token unreadable: {err}");
                None
            }
        }
    }

    /// One session-open round-trip, with the forced-refresh fallback: a
    /// cached token that the server rejects is dropped and the open retried
    /// exactly once with a fresh signature.
    pub(crate) async fn open_session(
        &self,
        state: &mut ClientState,
        reconnect: bool,
    ) -> Result<SessionOpenedPayload, ClientError> {
        let cached =
            state.token.as_ref().filter(|t| !t.is_expired(now_ms())).map(|t| t.token.clone());

        let opened = match self.send_session_open(cached.clone(), reconnect).await {
            Err(ClientError::Auth(reason)) if cached.is_some() => {
                log::info!("client: cached session token rejected ({reason}), refreshing");
                state.token = None;
                if let Some(cache) = &self.cache {
                    let _ = cache.kv_delete(KV_SESSION_TOKEN).await;
                }
                self.send_session_open(None, reconnect).await?
            }
            other => other?,
        };

        let token = SessionToken {
            token: opened.session_token.clone(),
            expires_at_ms: now_ms() + opened.token_ttl_secs.saturating_mul(1000),
        };
        if let Some(cache) = &self.cache {
            let raw = serde_json::to_string(&token).map_err(CacheError::Serialize)?;
            cache.kv_put(KV_SESSION_TOKEN, &raw).await?;
        }
        state.token = Some(token);
        Ok(opened)
    }

    async fn send_session_open(
        &self,
        session_token: Option<String>,
        reconnect: bool,
    ) -> Result<SessionOpenedPayload, ClientError> {
        // A missing token means the server will mint one; that path carries a
        // signature from the collaborator.
        let signature = if session_token.is_none() {
            self.signature_source
                .signature(&self.client_id, None, SignatureAction::Open, &[])
                .await?
        } else {
            None
        };
        let payload = SessionOpenPayload {
            client_id: self.client_id.clone(),
            tag: self.tag.clone(),
            variant: self.variant,
            session_token,
            signature: signature.map(Into::into),
            reconnect,
        };
        let frame = self.command(Opcode::SessionOpen, encode(&payload)?).await?;
        expect_response(frame, Opcode::SessionOpened)
    }

    /// Silent session replay after a reconnect. A gap response invalidates
    /// the whole cache in one sweep and fires a single missed-events
    /// notification.
    pub(crate) async fn resume_session(&self) {
        let mut state = self.state.lock().await;
        if state.status != SessionStatus::Opened {
            return;
        }
        match self.open_session(&mut state, true).await {
            Ok(opened) => {
                drop(state);
                if opened.gap {
                    log::info!("client: session resumed with a gap, invalidating cache");
                    if let Some(cache) = &self.cache {
                        match cache.invalidate_all().await {
                            Ok(count) => {
                                log::debug!("client: {count} cached conversation(s) invalidated")
                            }
                            Err(err) => log::warn!("client: gap invalidation failed: {err}"),
                        }
                    }
                    self.delegate.did_miss_events().await;
                }
                self.delegate.did_resume().await;
            }
            Err(err) => {
                log::warn!("client: session resume failed: {err}");
                state.status = SessionStatus::Closed;
                state.token = None;
                drop(state);
                self.connection.disconnect().await;
                self.delegate.did_close(err).await;
            }
        }
    }
}

fn ensure_opened(state: &ClientState) -> Result<(), ClientError> {
    if state.status == SessionStatus::Opened {
        Ok(())
    } else {
        Err(ClientError::InvalidState { expected: "opened", actual: state.status.as_str() })
    }
}

fn encode<T: serde::Serialize>(payload: &T) -> Result<Vec<u8>, ClientError> {
    command::encode_payload(payload).map_err(|err| ClientError::Protocol(err.to_string()))
}

/// Interpret a resolved command frame: an `ErrorResponse` maps onto the error
/// taxonomy, anything else must carry the expected opcode.
fn expect_response<T: serde::de::DeserializeOwned>(
    frame: Frame,
    expected: Opcode,
) -> Result<T, ClientError> {
    if frame.opcode == Opcode::ErrorResponse {
        let payload: ErrorPayload = command::decode_payload(&frame.payload)
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        return Err(ClientError::from_rejection(payload));
    }
    if frame.opcode != expected {
        return Err(ClientError::Protocol(format!(
            "expected {expected:?}, got {:?}",
            frame.opcode
        )));
    }
    command::decode_payload(&frame.payload).map_err(|err| ClientError::Protocol(err.to_string()))
}

fn snapshot_from_item(item: ConvItem) -> ConversationSnapshot {
    let last_message_at = item.last_message.as_ref().map(|message| message.timestamp);
    ConversationSnapshot {
        conversation_id: item.conversation_id,
        name: item.name,
        creator: item.creator,
        members: item.members,
        muted_members: item.muted_members,
        attributes: item.attributes,
        last_message: item.last_message.as_ref().map(last_message_summary),
        last_message_at,
        unread_count: item.unread_count.unwrap_or(0),
        created_at: item.created_at,
        updated_at: item.updated_at,
        should_fetch: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_connection::testing::{MockLink, MockServer, MockTransport};
    use tern_wire::command::{ConvNotifyPayload, ConvOp, MessageNotifyPayload};

    struct RecordingClientDelegate {
        tx: mpsc::UnboundedSender<String>,
    }

    impl RecordingClientDelegate {
        fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }
    }

    #[async_trait]
    impl ClientDelegate for RecordingClientDelegate {
        async fn did_pause(&self, _event: ConnectionEvent) {
            let _ = self.tx.send("paused".to_owned());
        }

        async fn did_resume(&self) {
            let _ = self.tx.send("resumed".to_owned());
        }

        async fn did_close(&self, error: ClientError) {
            let _ = self.tx.send(format!("closed:{error}"));
        }

        async fn did_miss_events(&self) {
            let _ = self.tx.send("missed_events".to_owned());
        }

        async fn did_receive_message(&self, conversation_id: &str, message: &MessageItem) {
            let _ = self.tx.send(format!("message:{conversation_id}:{}", message.message_id));
        }

        async fn conversation_event(&self, conversation_id: &str, event: &ConvNotifyPayload) {
            let _ = self.tx.send(format!("conv:{conversation_id}:{:?}", event.op));
        }

        async fn did_update_unread(&self, entries: &[tern_wire::command::UnreadEntry]) {
            let _ = self.tx.send(format!("unread:{}", entries.len()));
        }
    }

    struct Script {
        server: MockServer,
        link: Option<MockLink>,
    }

    impl Script {
        async fn accept(&mut self) {
            self.link = Some(self.server.next_link().await);
        }

        async fn expect(&mut self, opcode: Opcode) -> Frame {
            let link = self.link.as_mut().expect("no active link");
            let frame = link.recv_frame().await;
            assert_eq!(frame.opcode, opcode, "unexpected command opcode");
            frame
        }

        fn reply<T: serde::Serialize>(&self, serial: u32, opcode: Opcode, payload: &T) {
            let link = self.link.as_ref().expect("no active link");
            let bytes = command::encode_payload(payload).expect("encode reply");
            link.send_frame(&Frame::new(opcode, serial, bytes));
        }

        fn reply_error(&self, serial: u32, code: u32, reason: &str) {
            self.reply(
                serial,
                Opcode::ErrorResponse,
                &ErrorPayload { code, reason: reason.to_owned() },
            );
        }

        fn push<T: serde::Serialize>(&self, opcode: Opcode, payload: &T) {
            let link = self.link.as_ref().expect("no active link");
            let bytes = command::encode_payload(payload).expect("encode push");
            link.send_frame(&Frame::push(opcode, bytes));
        }

        fn drop_link(&mut self) {
            self.link = None;
        }
    }

    fn session_opened(token: &str, gap: bool) -> SessionOpenedPayload {
        SessionOpenedPayload {
            session_token: token.to_owned(),
            token_ttl_secs: 3600,
            resumed: gap,
            gap,
        }
    }

    fn test_client(delegate: Arc<dyn ClientDelegate>) -> (Client, Script) {
        let (transport, server) = MockTransport::pair();
        let mut config = ClientConfig::new("app1", "alice", transport);
        config.cache = CacheOption::InMemory;
        config.delegate = delegate;
        let client = Client::new(config).expect("client");
        (client, Script { server, link: None })
    }

    async fn open_client(client: &Client, script: &mut Script) {
        let open = tokio::spawn({
            let client = client.clone();
            async move { client.open(OpenOption::Default).await }
        });
        script.accept().await;
        let frame = script.expect(Opcode::SessionOpen).await;
        script.reply(frame.serial, Opcode::SessionOpened, &session_opened("st-1", false));
        open.await.expect("join").expect("open");
    }

    fn cached_snapshot(id: &str) -> ConversationSnapshot {
        let mut snapshot = ConversationSnapshot::new(id);
        snapshot.members = BTreeSet::from(["alice".to_owned(), "bob".to_owned()]);
        snapshot
    }

    #[tokio::test]
    async fn rejects_bad_client_ids_and_tags() {
        let (transport, _server) = MockTransport::pair();
        let config = ClientConfig::new("app1", "bad id!", transport.clone());
        assert!(matches!(Client::new(config), Err(ClientError::InvalidClientId)));

        let mut config = ClientConfig::new("app1", "alice", transport);
        config.tag = Some("default".to_owned());
        config.cache = CacheOption::InMemory;
        assert!(matches!(Client::new(config), Err(ClientError::InvalidTag)));
    }

    #[tokio::test]
    async fn open_performs_session_handshake() {
        let (client, mut script) = test_client(Arc::new(NoopClientDelegate));

        let open = tokio::spawn({
            let client = client.clone();
            async move { client.open(OpenOption::Default).await }
        });
        script.accept().await;
        let frame = script.expect(Opcode::SessionOpen).await;
        let payload: SessionOpenPayload =
            command::decode_payload(&frame.payload).expect("decode");
        assert_eq!(payload.client_id, "alice");
        assert_eq!(payload.variant, ProtocolVariant::V3);
        assert!(payload.session_token.is_none());
        assert!(!payload.reconnect);

        script.reply(frame.serial, Opcode::SessionOpened, &session_opened("st-1", false));
        open.await.expect("join").expect("open");

        assert_eq!(client.status().await, SessionStatus::Opened);
        assert_eq!(client.get_session_token(false).await.expect("token"), "st-1");
    }

    #[tokio::test]
    async fn open_retries_once_when_cached_token_rejected() {
        let (client, mut script) = test_client(Arc::new(NoopClientDelegate));

        // A previous run left a still-valid token behind.
        let stale = SessionToken {
            token: "st-stale".to_owned(),
            expires_at_ms: now_ms() + 3_600_000,
        };
        client
            .cache()
            .expect("cache")
            .kv_put(KV_SESSION_TOKEN, &serde_json::to_string(&stale).expect("json"))
            .await
            .expect("seed token");

        let open = tokio::spawn({
            let client = client.clone();
            async move { client.open(OpenOption::Default).await }
        });
        script.accept().await;

        let first = script.expect(Opcode::SessionOpen).await;
        let payload: SessionOpenPayload =
            command::decode_payload(&first.payload).expect("decode");
        assert_eq!(payload.session_token.as_deref(), Some("st-stale"));
        script.reply_error(first.serial, command::code::SESSION_TOKEN_EXPIRED, "expired");

        // Exactly one retry, now without the dead token.
        let second = script.expect(Opcode::SessionOpen).await;
        let payload: SessionOpenPayload =
            command::decode_payload(&second.payload).expect("decode");
        assert!(payload.session_token.is_none());
        script.reply(second.serial, Opcode::SessionOpened, &session_opened("st-fresh", false));

        open.await.expect("join").expect("open");
        assert_eq!(client.get_session_token(false).await.expect("token"), "st-fresh");
    }

    #[tokio::test]
    async fn open_without_cached_token_surfaces_auth_rejection() {
        let (client, mut script) = test_client(Arc::new(NoopClientDelegate));

        let open = tokio::spawn({
            let client = client.clone();
            async move { client.open(OpenOption::Default).await }
        });
        script.accept().await;
        let frame = script.expect(Opcode::SessionOpen).await;
        script.reply_error(frame.serial, command::code::UNAUTHORIZED, "who are you");

        let result = open.await.expect("join");
        assert!(matches!(result, Err(ClientError::Auth(_))));
        assert_eq!(client.status().await, SessionStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_with_gap_invalidates_cache_and_notifies_once() {
        let (delegate, mut events) = RecordingClientDelegate::pair();
        let (client, mut script) = test_client(delegate);
        open_client(&client, &mut script).await;

        let cache = client.cache().expect("cache");
        cache.insert_or_replace(&cached_snapshot("c1")).await.expect("insert");
        cache.insert_or_replace(&cached_snapshot("c2")).await.expect("insert");

        script.drop_link();
        assert_eq!(events.recv().await.as_deref(), Some("paused"));

        // The engine reconnects and the orchestrator silently replays open.
        script.accept().await;
        let frame = script.expect(Opcode::SessionOpen).await;
        let payload: SessionOpenPayload =
            command::decode_payload(&frame.payload).expect("decode");
        assert!(payload.reconnect);
        assert_eq!(payload.session_token.as_deref(), Some("st-1"));
        script.reply(frame.serial, Opcode::SessionOpened, &session_opened("st-1", true));

        assert_eq!(events.recv().await.as_deref(), Some("missed_events"));
        assert_eq!(events.recv().await.as_deref(), Some("resumed"));

        assert!(cache.get("c1").await.expect("get").expect("present").should_fetch);
        assert!(cache.get("c2").await.expect("get").expect("present").should_fetch);
        assert_eq!(client.status().await, SessionStatus::Opened);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_resume_does_not_invalidate() {
        let (delegate, mut events) = RecordingClientDelegate::pair();
        let (client, mut script) = test_client(delegate);
        open_client(&client, &mut script).await;

        let cache = client.cache().expect("cache");
        cache.insert_or_replace(&cached_snapshot("c1")).await.expect("insert");

        script.drop_link();
        assert_eq!(events.recv().await.as_deref(), Some("paused"));

        script.accept().await;
        let frame = script.expect(Opcode::SessionOpen).await;
        script.reply(frame.serial, Opcode::SessionOpened, &session_opened("st-1", false));

        assert_eq!(events.recv().await.as_deref(), Some("resumed"));
        assert!(!cache.get("c1").await.expect("get").expect("present").should_fetch);
    }

    #[tokio::test]
    async fn message_notify_updates_cache_and_delegate() {
        let (delegate, mut events) = RecordingClientDelegate::pair();
        let (client, mut script) = test_client(delegate);
        open_client(&client, &mut script).await;

        let cache = client.cache().expect("cache");
        cache.insert_or_replace(&cached_snapshot("c1")).await.expect("insert");

        script.push(
            Opcode::MessageNotify,
            &MessageNotifyPayload {
                conversation_id: "c1".to_owned(),
                message: MessageItem {
                    message_id: "m1".to_owned(),
                    from: "bob".to_owned(),
                    timestamp: 1_000,
                    body: "hi".to_owned(),
                    mention_all: false,
                    mention_ids: Vec::new(),
                },
                transient: false,
            },
        );
        assert_eq!(events.recv().await.as_deref(), Some("message:c1:m1"));

        let stored = cache.get("c1").await.expect("get").expect("present");
        assert_eq!(stored.unread_count, 1);
        assert_eq!(stored.last_message_at, Some(1_000));
        assert_eq!(stored.last_message.expect("summary").message_id, "m1");
    }

    #[tokio::test]
    async fn opaque_conversation_update_marks_should_fetch() {
        let (delegate, mut events) = RecordingClientDelegate::pair();
        let (client, mut script) = test_client(delegate);
        open_client(&client, &mut script).await;

        let cache = client.cache().expect("cache");
        cache.insert_or_replace(&cached_snapshot("c1")).await.expect("insert");

        script.push(
            Opcode::ConvNotify,
            &ConvNotifyPayload {
                conversation_id: "c1".to_owned(),
                op: ConvOp::Updated,
                member_ids: BTreeSet::new(),
                initiated_by: Some("bob".to_owned()),
                timestamp: 2_000,
            },
        );
        assert_eq!(events.recv().await.as_deref(), Some("conv:c1:Updated"));
        assert!(cache.get("c1").await.expect("get").expect("present").should_fetch);

        // An authoritative fetch clears the flag for exactly this
        // conversation.
        let fetch = tokio::spawn({
            let client = client.clone();
            async move { client.fetch_conversation("c1").await }
        });
        let frame = script.expect(Opcode::ConvQuery).await;
        script.reply(
            frame.serial,
            Opcode::ConvQueryResult,
            &ConvQueryResultPayload {
                conversations: vec![ConvItem {
                    conversation_id: "c1".to_owned(),
                    members: BTreeSet::from(["alice".to_owned(), "bob".to_owned()]),
                    created_at: 1,
                    updated_at: 2_000,
                    ..ConvItem::default()
                }],
            },
        );
        fetch.await.expect("join").expect("fetch");
        assert!(!cache.get("c1").await.expect("get").expect("present").should_fetch);
    }

    #[tokio::test]
    async fn create_conversation_then_membership_roundtrip() {
        let (client, mut script) = test_client(Arc::new(NoopClientDelegate));
        open_client(&client, &mut script).await;

        let create = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .create_conversation(
                        BTreeSet::from(["bob".to_owned()]),
                        true,
                        Some("pair".to_owned()),
                        None,
                    )
                    .await
            }
        });
        let frame = script.expect(Opcode::ConvCreate).await;
        let payload: ConvCreatePayload = command::decode_payload(&frame.payload).expect("decode");
        // The caller is always a member.
        assert!(payload.members.contains("alice"));
        assert!(payload.unique);
        script.reply(
            frame.serial,
            Opcode::ConvCreated,
            &ConvCreatedPayload {
                conversation_id: "c77".to_owned(),
                created_at: 5_000,
                existing: false,
            },
        );
        let snapshot = create.await.expect("join").expect("create");
        assert_eq!(snapshot.conversation_id, "c77");

        let cache = client.cache().expect("cache");
        assert!(cache.get("c77").await.expect("get").is_some());

        let add = tokio::spawn({
            let client = client.clone();
            async move { client.add_members("c77", BTreeSet::from(["carol".to_owned()])).await }
        });
        let frame = script.expect(Opcode::MembersAdd).await;
        script.reply(
            frame.serial,
            Opcode::MembersAdded,
            &MembersResultPayload {
                conversation_id: "c77".to_owned(),
                member_ids: BTreeSet::from(["carol".to_owned()]),
                updated_at: 5_100,
            },
        );
        add.await.expect("join").expect("add members");

        let stored = cache.get("c77").await.expect("get").expect("present");
        assert!(stored.members.contains("carol"));
        assert_eq!(stored.updated_at, 5_100);
    }

    #[tokio::test]
    async fn send_message_refreshes_last_message_summary() {
        let (client, mut script) = test_client(Arc::new(NoopClientDelegate));
        open_client(&client, &mut script).await;

        let cache = client.cache().expect("cache");
        cache.insert_or_replace(&cached_snapshot("c1")).await.expect("insert");

        let send = tokio::spawn({
            let client = client.clone();
            async move { client.send_message("c1", "hello bob", MessageOptions::default()).await }
        });
        let frame = script.expect(Opcode::MessageSend).await;
        script.reply(
            frame.serial,
            Opcode::MessageSent,
            &MessageSentPayload { message_id: "m42".to_owned(), timestamp: 9_000 },
        );
        let message = send.await.expect("join").expect("send");
        assert_eq!(message.message_id, "m42");
        assert_eq!(message.from, "alice");

        let stored = cache.get("c1").await.expect("get").expect("present");
        assert_eq!(stored.last_message_at, Some(9_000));
        assert_eq!(stored.last_message.expect("summary").text, "hello bob");
    }

    #[tokio::test]
    async fn force_refresh_obtains_new_token() {
        let (client, mut script) = test_client(Arc::new(NoopClientDelegate));
        open_client(&client, &mut script).await;

        let refresh = tokio::spawn({
            let client = client.clone();
            async move { client.get_session_token(true).await }
        });
        let frame = script.expect(Opcode::SessionOpen).await;
        let payload: SessionOpenPayload =
            command::decode_payload(&frame.payload).expect("decode");
        assert!(payload.session_token.is_none());
        assert!(payload.reconnect);
        script.reply(frame.serial, Opcode::SessionOpened, &session_opened("st-2", false));

        assert_eq!(refresh.await.expect("join").expect("token"), "st-2");
        assert_eq!(client.get_session_token(false).await.expect("token"), "st-2");
    }

    #[tokio::test]
    async fn close_sends_session_close_and_disconnects() {
        let (client, mut script) = test_client(Arc::new(NoopClientDelegate));
        open_client(&client, &mut script).await;

        let close = tokio::spawn({
            let client = client.clone();
            async move { client.close().await }
        });
        let frame = script.expect(Opcode::SessionClose).await;
        script.reply(frame.serial, Opcode::SessionClosed, &SessionClosedPayload::default());
        close.await.expect("join").expect("close");

        assert_eq!(client.status().await, SessionStatus::Closed);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn operations_require_an_opened_session() {
        let (client, _script) = test_client(Arc::new(NoopClientDelegate));
        let result = client.send_message("c1", "hi", MessageOptions::default()).await;
        assert!(matches!(result, Err(ClientError::InvalidState { expected: "opened", .. })));
    }
}
