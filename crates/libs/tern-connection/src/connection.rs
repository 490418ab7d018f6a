//! The connection engine.
//!
//! One [`Connection`] owns at most one open transport link. Protocol state
//! (the state machine, the pending-command table, the active sink) lives in a
//! single `Handler` behind a tokio mutex, the connection's serial context.
//! Long-lived jobs (timeout sweep, reachability watch, lifecycle watch) are
//! spawned at construction and stopped through a cancellation token, the same
//! shape the transport layer uses for its periodic link jobs.
//!
//! An epoch counter increments every time the active link or the armed
//! reconnect timer is torn down; tasks snapshot the epoch and bail when it
//! moved on, which keeps exactly one reader and at most one armed timer alive
//! no matter how many reachability or lifecycle events fire back to back.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tern_wire::{Frame, Opcode, ProtocolVariant};

use crate::backoff::ReconnectBackoff;
use crate::delegate::{ConnectionDelegate, ConnectionEvent};
use crate::error::CommandError;
use crate::lifecycle::{AlwaysForeground, AppLifecycleSource, AppPhase};
use crate::pending::{PendingTable, ResendPolicy};
use crate::reachability::{AlwaysReachable, ReachabilitySource, ReachabilityStatus};
use crate::transport::{FrameSink, FrameSource, FrameTransport};

/// Default maximum wait for a command's matched response.
pub const DEFAULT_COMMAND_TTL: Duration = Duration::from_secs(30);

/// Resolution of the pending-table timeout sweep.
const COMMAND_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct ConnectionConfig {
    pub transport: Arc<dyn FrameTransport>,
    pub delegate: Arc<dyn ConnectionDelegate>,
    pub reachability: Arc<dyn ReachabilitySource>,
    pub lifecycle: Arc<dyn AppLifecycleSource>,
    pub variant: ProtocolVariant,
    pub command_ttl: Duration,
    /// Tear the link down and suspend reconnection while backgrounded.
    pub suspend_when_backgrounded: bool,
    /// Runtime the delegate dispatcher runs on; defaults to the current one.
    pub delegate_runtime: Option<Handle>,
}

impl ConnectionConfig {
    pub fn new(transport: Arc<dyn FrameTransport>, delegate: Arc<dyn ConnectionDelegate>) -> Self {
        Self {
            transport,
            delegate,
            reachability: Arc::new(AlwaysReachable::default()),
            lifecycle: Arc::new(AlwaysForeground::default()),
            variant: ProtocolVariant::default(),
            command_ttl: DEFAULT_COMMAND_TTL,
            suspend_when_backgrounded: true,
            delegate_runtime: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A transport loss is being recovered from; a backoff timer may be armed
    /// or reconnection may be suspended pending reachability/foreground.
    Reconnecting,
}

enum DelegateEvent {
    InConnecting,
    DidConnect,
    FailedConnecting(ConnectionEvent),
    DidDisconnect(ConnectionEvent),
    Received(Frame),
    ProtocolError(String),
}

struct Handler {
    state: ConnectionState,
    pending: PendingTable,
    sink: Option<Box<dyn FrameSink>>,
    backoff: ReconnectBackoff,
    auto_reconnect: bool,
    epoch: u64,
}

struct Core {
    handler: Mutex<Handler>,
    transport: Arc<dyn FrameTransport>,
    reachability: Arc<dyn ReachabilitySource>,
    lifecycle: Arc<dyn AppLifecycleSource>,
    suspend_when_backgrounded: bool,
    events: mpsc::UnboundedSender<DelegateEvent>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

/// A reconnect-resilient duplex RTM connection.
///
/// Must be created inside a tokio runtime. Dropping the connection stops all
/// internal tasks; pending commands resolve with `Cancelled` through their
/// one-shot channels being dropped.
pub struct Connection {
    core: Arc<Core>,
    state_rx: watch::Receiver<ConnectionState>,
    variant: ProtocolVariant,
    default_ttl: Duration,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let core = Arc::new(Core {
            handler: Mutex::new(Handler {
                state: ConnectionState::Disconnected,
                pending: PendingTable::new(),
                sink: None,
                backoff: ReconnectBackoff::default(),
                auto_reconnect: true,
                epoch: 0,
            }),
            transport: config.transport,
            reachability: config.reachability,
            lifecycle: config.lifecycle,
            suspend_when_backgrounded: config.suspend_when_backgrounded,
            events: events_tx,
            state_tx,
            cancel,
        });

        let dispatcher = Core::run_dispatcher(config.delegate, events_rx);
        match config.delegate_runtime {
            Some(handle) => {
                handle.spawn(dispatcher);
            }
            None => {
                tokio::spawn(dispatcher);
            }
        }
        tokio::spawn(Arc::clone(&core).run_sweep());
        tokio::spawn(Arc::clone(&core).run_reachability_watch());
        tokio::spawn(Arc::clone(&core).run_lifecycle_watch());

        Self { core, state_rx, variant: config.variant, default_ttl: config.command_ttl }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    /// Begin connecting. No-op while already `Connecting`/`Connected`; from
    /// `Reconnecting` this skips the armed backoff timer and attempts now.
    pub async fn connect(&self) {
        let mut handler = self.core.handler.lock().await;
        match handler.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.core.begin_attempt(&mut handler);
            }
        }
    }

    /// Explicitly disconnect. Every pending command, replayable or not,
    /// resolves with `Cancelled` and the pending table is left empty.
    pub async fn disconnect(&self) {
        let mut handler = self.core.handler.lock().await;
        handler.epoch += 1;
        if let Some(mut sink) = handler.sink.take() {
            sink.close().await;
        }
        handler.pending.cancel_all();
        if handler.state != ConnectionState::Disconnected {
            self.core.set_state(&mut handler, ConnectionState::Disconnected);
            self.core.emit(DelegateEvent::DidDisconnect(ConnectionEvent::DisconnectInvoked));
        }
    }

    /// Tear the active link down as if the transport dropped and attempt an
    /// immediate reconnect. Used when the server asks the client to re-login
    /// (goaway).
    pub async fn cycle(&self) {
        let mut handler = self.core.handler.lock().await;
        if !matches!(handler.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return;
        }
        let event =
            ConnectionEvent::TransportFailure("server requested reconnection".to_owned());
        self.core.teardown(&mut handler, event).await;
        if handler.state == ConnectionState::Reconnecting {
            self.core.begin_attempt(&mut handler);
        }
    }

    /// Enable or disable automatic reconnection after transport loss.
    /// Disabling while `Reconnecting` cancels recovery and lands in
    /// `Disconnected`.
    pub async fn set_auto_reconnection_enabled(&self, enabled: bool) {
        let mut handler = self.core.handler.lock().await;
        handler.auto_reconnect = enabled;
        if !enabled && handler.state == ConnectionState::Reconnecting {
            handler.epoch += 1;
            handler.pending.cancel_all();
            self.core.set_state(&mut handler, ConnectionState::Disconnected);
            log::debug!("conn: auto reconnection disabled, recovery abandoned");
        }
    }

    /// Send a command with the default TTL and fail-fast resend policy.
    pub async fn send_command(
        &self,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<Frame, CommandError> {
        self.send_command_with(opcode, payload, self.default_ttl, ResendPolicy::FailFast).await
    }

    /// Send a command. Resolves exactly once: the matched response frame, or
    /// `Timeout` / `Transport` / `Cancelled`.
    pub async fn send_command_with(
        &self,
        opcode: Opcode,
        payload: Vec<u8>,
        ttl: Duration,
        resend: ResendPolicy,
    ) -> Result<Frame, CommandError> {
        self.core.send_command_with(opcode, payload, ttl, resend).await
    }

    /// Number of commands currently awaiting resolution.
    pub async fn pending_commands(&self) -> usize {
        self.core.handler.lock().await.pending.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

impl Core {
    fn emit(&self, event: DelegateEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, handler: &mut Handler, next: ConnectionState) {
        if handler.state != next {
            log::debug!("conn: {:?} -> {:?}", handler.state, next);
            handler.state = next;
            self.state_tx.send_replace(next);
        }
    }

    /// Start a connect attempt now. Invalidate any armed timer first.
    fn begin_attempt(self: &Arc<Self>, handler: &mut Handler) {
        handler.epoch += 1;
        let epoch = handler.epoch;
        self.set_state(handler, ConnectionState::Connecting);
        self.emit(DelegateEvent::InConnecting);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.run_attempt(epoch).await;
        });
    }

    async fn run_attempt(self: Arc<Self>, epoch: u64) {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return,
            opened = self.transport.open() => opened,
        };

        let mut handler = self.handler.lock().await;
        if handler.epoch != epoch || handler.state != ConnectionState::Connecting {
            // A teardown or explicit disconnect superseded this attempt.
            if let Ok((mut sink, _)) = opened {
                sink.close().await;
            }
            return;
        }

        match opened {
            Ok((sink, source)) => {
                handler.sink = Some(sink);
                handler.backoff.reset();
                self.set_state(&mut handler, ConnectionState::Connected);

                // Commands that survived the gap under ReplayOnReconnect go
                // out again on the fresh link before anything else.
                for bytes in handler.pending.replay_frames() {
                    let result = match handler.sink.as_mut() {
                        Some(sink) => sink.send(&bytes).await,
                        None => break,
                    };
                    if let Err(err) = result {
                        log::warn!("conn: replay write failed: {err}");
                        let event = ConnectionEvent::TransportFailure(err.to_string());
                        self.teardown(&mut handler, event).await;
                        return;
                    }
                }

                self.emit(DelegateEvent::DidConnect);
                let core = Arc::clone(&self);
                tokio::spawn(async move {
                    core.run_reader(source, epoch).await;
                });
            }
            Err(err) => {
                log::debug!("conn: connect attempt failed: {err}");
                self.emit(DelegateEvent::FailedConnecting(ConnectionEvent::TransportFailure(
                    err.to_string(),
                )));
                self.schedule_reconnect(&mut handler);
            }
        }
    }

    async fn run_reader(self: Arc<Self>, mut source: Box<dyn FrameSource>, epoch: u64) {
        loop {
            let inbound = tokio::select! {
                _ = self.cancel.cancelled() => return,
                inbound = source.recv() => inbound,
            };
            match inbound {
                Ok(Some(bytes)) => self.route_inbound(&bytes, epoch).await,
                Ok(None) => {
                    self.on_transport_drop(epoch, "closed by peer".to_owned()).await;
                    return;
                }
                Err(err) => {
                    self.on_transport_drop(epoch, err.to_string()).await;
                    return;
                }
            }
        }
    }

    async fn route_inbound(&self, bytes: &[u8], epoch: u64) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                // Report and carry on; a bad frame does not cost the link.
                log::warn!("conn: malformed inbound frame: {err}");
                self.emit(DelegateEvent::ProtocolError(err.to_string()));
                return;
            }
        };

        if frame.is_response() {
            let mut handler = self.handler.lock().await;
            if handler.epoch != epoch {
                return;
            }
            match handler.pending.complete(frame.serial, Ok(frame)) {
                None => return,
                Some(Ok(frame)) => {
                    // No pending entry: the command already resolved, for
                    // example by timeout. Hand the frame to the delegate.
                    log::debug!("conn: unmatched response serial {}", frame.serial);
                    drop(handler);
                    self.emit(DelegateEvent::Received(frame));
                    return;
                }
                Some(Err(_)) => return,
            }
        }

        self.emit(DelegateEvent::Received(frame));
    }

    async fn on_transport_drop(self: &Arc<Self>, epoch: u64, reason: String) {
        let mut handler = self.handler.lock().await;
        if handler.epoch != epoch
            || !matches!(handler.state, ConnectionState::Connecting | ConnectionState::Connected)
        {
            return;
        }
        log::info!("conn: transport dropped: {reason}");
        self.teardown(&mut handler, ConnectionEvent::TransportFailure(reason)).await;
    }

    /// Close the active link and leave `Connected`/`Connecting`. Fail-fast
    /// pending commands resolve immediately, never left to expire via
    /// TTL. With auto reconnection the state becomes `Reconnecting` and
    /// recovery is scheduled; otherwise everything cancels into
    /// `Disconnected`.
    async fn teardown(self: &Arc<Self>, handler: &mut Handler, event: ConnectionEvent) {
        handler.epoch += 1;
        if let Some(mut sink) = handler.sink.take() {
            sink.close().await;
        }
        if handler.auto_reconnect {
            let error = CommandError::Transport(event.to_string());
            let failed = handler.pending.fail_disconnected(&error);
            if failed > 0 {
                log::debug!("conn: {failed} pending command(s) failed on drop");
            }
            self.emit(DelegateEvent::DidDisconnect(event));
            self.schedule_reconnect(handler);
        } else {
            handler.pending.cancel_all();
            self.set_state(handler, ConnectionState::Disconnected);
            self.emit(DelegateEvent::DidDisconnect(event));
        }
    }

    /// Enter `Reconnecting` and arm the single backoff timer, unless gating
    /// (reachability, background) suspends recovery; the watch jobs resume it
    /// when conditions clear.
    fn schedule_reconnect(self: &Arc<Self>, handler: &mut Handler) {
        if !handler.auto_reconnect {
            handler.pending.cancel_all();
            self.set_state(handler, ConnectionState::Disconnected);
            return;
        }
        self.set_state(handler, ConnectionState::Reconnecting);

        if self.reachability.status() == ReachabilityStatus::Unreachable {
            log::debug!("conn: reconnection suspended, network unreachable");
            return;
        }
        if self.suspend_when_backgrounded && self.lifecycle.phase() == AppPhase::Background {
            log::debug!("conn: reconnection suspended, app in background");
            return;
        }

        let delay = handler.backoff.next_delay();
        handler.epoch += 1;
        let epoch = handler.epoch;
        log::debug!("conn: reconnect attempt in {delay:?}");
        let core = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = core.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut handler = core.handler.lock().await;
            if handler.epoch != epoch || handler.state != ConnectionState::Reconnecting {
                return;
            }
            core.begin_attempt(&mut handler);
        });
    }

    async fn send_command_with(
        self: &Arc<Self>,
        opcode: Opcode,
        payload: Vec<u8>,
        ttl: Duration,
        resend: ResendPolicy,
    ) -> Result<Frame, CommandError> {
        let rx = {
            let mut handler = self.handler.lock().await;
            if handler.state != ConnectionState::Connected {
                return Err(CommandError::Transport("not connected".to_owned()));
            }

            let serial = handler.pending.next_serial();
            let bytes = Frame::new(opcode, serial, payload).encode();
            let deadline = Instant::now() + ttl;
            let rx = handler.pending.insert(serial, deadline, resend, &bytes);

            let written = match handler.sink.as_mut() {
                Some(sink) => sink.send(&bytes).await,
                None => Err(crate::transport::TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no active link",
                ))),
            };
            if let Err(err) = written {
                // The teardown resolves this command along with the rest of
                // the fail-fast entries.
                log::warn!("conn: write failed: {err}");
                let event = ConnectionEvent::TransportFailure(err.to_string());
                self.teardown(&mut handler, event).await;
            }
            rx
        };

        match rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: the connection itself went
            // away.
            Err(_) => Err(CommandError::Cancelled),
        }
    }

    async fn run_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(COMMAND_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let mut handler = self.handler.lock().await;
            let expired = handler.pending.sweep(Instant::now());
            if expired > 0 {
                log::debug!("conn: {expired} command(s) timed out");
            }
        }
    }

    async fn run_reachability_watch(self: Arc<Self>) {
        let mut rx = self.reachability.subscribe();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let status = *rx.borrow();
            let mut handler = self.handler.lock().await;
            match status {
                ReachabilityStatus::Unreachable => {
                    if matches!(
                        handler.state,
                        ConnectionState::Connecting | ConnectionState::Connected
                    ) {
                        self.teardown(&mut handler, ConnectionEvent::NetworkNotReachable).await;
                    }
                }
                ReachabilityStatus::Reachable => {
                    if handler.state == ConnectionState::Reconnecting {
                        self.begin_attempt(&mut handler);
                    }
                }
            }
        }
    }

    async fn run_lifecycle_watch(self: Arc<Self>) {
        let mut rx = self.lifecycle.subscribe();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let phase = *rx.borrow();
            let mut handler = self.handler.lock().await;
            match phase {
                AppPhase::Background => {
                    if self.suspend_when_backgrounded
                        && matches!(
                            handler.state,
                            ConnectionState::Connecting | ConnectionState::Connected
                        )
                    {
                        self.teardown(&mut handler, ConnectionEvent::AppInBackground).await;
                    }
                }
                AppPhase::Foreground => {
                    if handler.state == ConnectionState::Reconnecting {
                        self.begin_attempt(&mut handler);
                    }
                }
            }
        }
    }

    async fn run_dispatcher(
        delegate: Arc<dyn ConnectionDelegate>,
        mut events: mpsc::UnboundedReceiver<DelegateEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                DelegateEvent::InConnecting => delegate.in_connecting().await,
                DelegateEvent::DidConnect => delegate.did_connect().await,
                DelegateEvent::FailedConnecting(event) => delegate.failed_connecting(event).await,
                DelegateEvent::DidDisconnect(event) => delegate.did_disconnect(event).await,
                DelegateEvent::Received(frame) => delegate.received_frame(frame).await,
                DelegateEvent::ProtocolError(reason) => delegate.protocol_error(reason).await,
            }
        }
    }
}
