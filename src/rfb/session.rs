//! The session controller.
//!
//! Each session is one spawned task that owns the transport handle, the
//! protocol machine, the timers, and the event bus. The public
//! [`RfbSession`] handle talks to it over a command channel, so inbound
//! bytes, timer fires, and user operations are serialised onto a single
//! logical queue and session state needs no locks.

use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant, Sleep};

use crate::rfb::events::{EventBus, EventReceiver};
use crate::rfb::machine::ProtocolMachine;
use crate::rfb::protocol;
use crate::rfb::transport::{Connect, TransportEvent, TransportHandle, WireCommand, WsConnector};
use crate::rfb::types::{
    Event, KeyInput, PointerInput, RfbError, RfbErrorKind, SessionOptions, SessionState,
    SessionStats,
};

/// Teardown is deferred by this interval so a frontend that unmounts and
/// immediately remounts can reattach to the live session.
pub const TEARDOWN_GRACE: Duration = Duration::from_millis(100);

const RECONNECT_BASE_BACKOFF_MS: u64 = 1000;
const RECONNECT_MAX_BACKOFF_MS: u64 = 10_000;

/// Commands sent from the public handle to the session task.
enum SessionCommand {
    Connect {
        reply: oneshot::Sender<Result<(), RfbError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    KeyEvent(KeyInput),
    PointerEvent(PointerInput),
    RequestUpdate {
        incremental: bool,
    },
    GetState {
        reply: oneshot::Sender<SessionState>,
    },
    GetStats {
        reply: oneshot::Sender<SessionStats>,
    },
    Subscribe {
        reply: oneshot::Sender<EventReceiver>,
    },
    Shutdown,
}

// ── Public handle ───────────────────────────────────────────────────────

/// Handle to a session task.
///
/// Cheap to clone; the task keeps running while any handle exists and for
/// the grace interval after the last one is dropped or `shutdown` is
/// requested.
#[derive(Clone)]
pub struct RfbSession {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl RfbSession {
    /// Create an idle session using the WebSocket connector.
    pub fn new(options: SessionOptions) -> Self {
        Self::with_connector(options, WsConnector)
    }

    /// Create an idle session over a caller-supplied connector.
    pub fn with_connector<C: Connect>(options: SessionOptions, connector: C) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task = SessionTask::new(options, connector, cmd_rx);
        tokio::spawn(task.run());
        Self { cmd_tx }
    }

    /// Open the transport and run the handshake.
    ///
    /// Completes exactly once: when the session reaches `Connected`, or
    /// on the first terminal failure (including the connect timeout).
    pub async fn connect(&self) -> Result<(), RfbError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Connect { reply: tx }).await?;
        rx.await.map_err(|_| RfbError::session_gone())?
    }

    /// Tear the connection down. Idempotent.
    pub async fn disconnect(&self) -> Result<(), RfbError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Disconnect { reply: tx }).await?;
        rx.await.map_err(|_| RfbError::session_gone())
    }

    /// Forward a key event. Dropped unless connected and not view-only.
    pub async fn send_key_event(&self, input: KeyInput) -> Result<(), RfbError> {
        self.send(SessionCommand::KeyEvent(input)).await
    }

    /// Forward a pointer event. Dropped unless connected and not
    /// view-only.
    pub async fn send_pointer_event(&self, input: PointerInput) -> Result<(), RfbError> {
        self.send(SessionCommand::PointerEvent(input)).await
    }

    /// Ask the server for a full-screen framebuffer update.
    pub async fn request_framebuffer_update(&self, incremental: bool) -> Result<(), RfbError> {
        self.send(SessionCommand::RequestUpdate { incremental }).await
    }

    /// Snapshot of the observable session state.
    pub async fn get_state(&self) -> Result<SessionState, RfbError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::GetState { reply: tx }).await?;
        rx.await.map_err(|_| RfbError::session_gone())
    }

    /// Byte/frame counters.
    pub async fn get_stats(&self) -> Result<SessionStats, RfbError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::GetStats { reply: tx }).await?;
        rx.await.map_err(|_| RfbError::session_gone())
    }

    /// Subscribe to session events, delivered in emission order.
    pub async fn subscribe(&self) -> Result<EventReceiver, RfbError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Subscribe { reply: tx }).await?;
        rx.await.map_err(|_| RfbError::session_gone())
    }

    /// Request teardown. The task disconnects and exits after the grace
    /// interval unless another command arrives first.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), RfbError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RfbError::session_gone())
    }
}

// ── Session task ────────────────────────────────────────────────────────

enum Wake {
    Command(Option<SessionCommand>),
    Transport(Option<TransportEvent>),
    ConnectTimeout,
    ReconnectFire,
    GraceFire,
}

struct SessionTask<C> {
    options: SessionOptions,
    connector: C,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    commands_open: bool,
    bus: EventBus,
    state: SessionState,
    stats: SessionStats,
    machine: Option<ProtocolMachine>,
    transport: Option<TransportHandle>,
    connect_reply: Option<oneshot::Sender<Result<(), RfbError>>>,
    connect_deadline: Option<Pin<Box<Sleep>>>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    grace_timer: Option<Pin<Box<Sleep>>>,
    reconnect_attempts: u32,
    /// True once this connect cycle has reached `Connected`; gates
    /// reconnect eligibility. Cleared by explicit disconnect and by
    /// terminal failures.
    was_connected: bool,
}

impl<C: Connect> SessionTask<C> {
    fn new(options: SessionOptions, connector: C, cmd_rx: mpsc::Receiver<SessionCommand>) -> Self {
        Self {
            options,
            connector,
            cmd_rx,
            commands_open: true,
            bus: EventBus::new(),
            state: SessionState::default(),
            stats: SessionStats::default(),
            machine: None,
            transport: None,
            connect_reply: None,
            connect_deadline: None,
            reconnect_timer: None,
            grace_timer: None,
            reconnect_attempts: 0,
            was_connected: false,
        }
    }

    async fn run(mut self) {
        loop {
            let wake = next_wake(
                &mut self.cmd_rx,
                self.commands_open,
                self.transport.as_mut(),
                self.connect_deadline.as_mut(),
                self.reconnect_timer.as_mut(),
                self.grace_timer.as_mut(),
            )
            .await;

            match wake {
                Wake::Command(Some(cmd)) => self.handle_command(cmd).await,
                Wake::Command(None) => {
                    // Every handle is gone. Linger for the grace interval
                    // in case a clone taken earlier is still coming.
                    self.commands_open = false;
                    if self.grace_timer.is_none() {
                        self.arm_grace();
                    }
                }
                Wake::Transport(Some(ev)) => self.handle_transport_event(ev).await,
                Wake::Transport(None) => {
                    // Pump ended without a close notification.
                    self.handle_close(1006, "transport task ended".into()).await;
                }
                Wake::ConnectTimeout => self.handle_connect_timeout().await,
                Wake::ReconnectFire => {
                    self.reconnect_timer = None;
                    info!(
                        "reconnect attempt {} of {}",
                        self.reconnect_attempts, self.options.max_reconnect_attempts
                    );
                    self.start_connect_cycle().await;
                }
                Wake::GraceFire => {
                    debug!("teardown grace elapsed, session exiting");
                    self.user_disconnect().await;
                    break;
                }
            }
        }
    }

    // ── Command handling ────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: SessionCommand) {
        if !matches!(cmd, SessionCommand::Shutdown) && self.grace_timer.is_some() {
            debug!("pending teardown cancelled by new command");
            self.grace_timer = None;
        }

        match cmd {
            SessionCommand::Connect { reply } => self.cmd_connect(reply).await,
            SessionCommand::Disconnect { reply } => {
                self.user_disconnect().await;
                let _ = reply.send(());
            }
            SessionCommand::KeyEvent(input) => self.cmd_key_event(input).await,
            SessionCommand::PointerEvent(input) => self.cmd_pointer_event(input).await,
            SessionCommand::RequestUpdate { incremental } => {
                self.cmd_request_update(incremental).await;
            }
            SessionCommand::GetState { reply } => {
                let _ = reply.send(self.state.clone());
            }
            SessionCommand::GetStats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            SessionCommand::Subscribe { reply } => {
                let _ = reply.send(self.bus.subscribe());
            }
            SessionCommand::Shutdown => {
                if self.grace_timer.is_none() {
                    self.arm_grace();
                }
            }
        }
    }

    async fn cmd_connect(&mut self, reply: oneshot::Sender<Result<(), RfbError>>) {
        if self.state.connecting || self.state.connected {
            let _ = reply.send(Err(RfbError::already_active()));
            return;
        }
        if !endpoint_scheme_ok(&self.options.endpoint) {
            let err = RfbError::invalid_endpoint(format!(
                "endpoint must use ws or wss: {}",
                self.options.endpoint
            ));
            self.state.error = Some(err.message.clone());
            self.publish(Event::Error {
                message: err.message.clone(),
            });
            let _ = reply.send(Err(err));
            return;
        }

        // A user connect starts a fresh cycle.
        self.reconnect_attempts = 0;
        self.reconnect_timer = None;
        self.was_connected = false;
        self.connect_reply = Some(reply);
        self.start_connect_cycle().await;
    }

    /// Open a transport and enter the handshake. Shared by user connects
    /// and reconnect attempts.
    async fn start_connect_cycle(&mut self) {
        self.transport = None;
        self.machine = Some(ProtocolMachine::new(
            self.options.password.clone(),
            self.options.debug,
        ));
        self.state.connecting = true;
        self.state.connected = false;
        self.state.error = None;
        self.state.server_name = None;
        self.state.width = 0;
        self.state.height = 0;
        self.publish(Event::Connecting);

        let deadline = Instant::now() + Duration::from_millis(self.options.timeout_ms);
        self.connect_deadline = Some(Box::pin(sleep_until(deadline)));

        info!("connecting to {}", self.options.endpoint);
        match tokio::time::timeout_at(deadline, self.connector.connect(&self.options.endpoint))
            .await
        {
            Ok(Ok(handle)) => {
                // The server speaks first; the machine waits for its
                // version banner.
                self.transport = Some(handle);
            }
            Ok(Err(err)) => self.fail_session(err).await,
            Err(_) => {
                self.fail_session(RfbError::timeout(format!(
                    "connect to {} timed out",
                    self.options.endpoint
                )))
                .await;
            }
        }
    }

    async fn cmd_key_event(&mut self, input: KeyInput) {
        if !self.input_allowed() {
            return;
        }
        let Some(sym) = protocol::lookup_keysym(&input.key) else {
            debug!("dropping unmapped key {:?}", input.key);
            return;
        };
        self.send_wire(protocol::build_key_event(input.down, sym)).await;
    }

    async fn cmd_pointer_event(&mut self, input: PointerInput) {
        if !self.input_allowed() {
            return;
        }
        let scale = self.options.effective_scale();
        let x = clamp_coord(input.x / scale, self.state.width);
        let y = clamp_coord(input.y / scale, self.state.height);
        self.send_wire(protocol::build_pointer_event(input.button_mask, x, y))
            .await;
    }

    async fn cmd_request_update(&mut self, incremental: bool) {
        if !self.is_protocol_connected() {
            return;
        }
        self.send_wire(protocol::build_fb_update_request(
            incremental,
            0,
            0,
            self.state.width,
            self.state.height,
        ))
        .await;
    }

    // ── Transport handling ──────────────────────────────────────────

    async fn handle_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Message(bytes) => self.handle_inbound(bytes).await,
            TransportEvent::Error(info) => {
                // A Closed event follows; the policy keys off its code.
                warn!("transport error: {}", info);
            }
            TransportEvent::Closed { code, reason } => self.handle_close(code, reason).await,
        }
    }

    async fn handle_inbound(&mut self, bytes: Vec<u8>) {
        self.stats.bytes_received += bytes.len() as u64;
        self.stats.last_activity = Some(Utc::now().to_rfc3339());

        let result = match self.machine.as_mut() {
            Some(machine) => machine.feed(&bytes),
            None => return,
        };

        match result {
            Ok(out) => {
                // Events go out before the bytes they triggered, so the
                // Connected event precedes the initial update request.
                for ev in out.events {
                    match &ev {
                        Event::Connected {
                            width,
                            height,
                            server_name,
                        } => self.on_connected(*width, *height, server_name.clone()),
                        Event::Resize { width, height } => {
                            self.state.width = *width;
                            self.state.height = *height;
                        }
                        Event::FramebufferUpdate { .. } => self.stats.frame_count += 1,
                        _ => {}
                    }
                    self.publish(ev);
                }
                for msg in out.outbound {
                    self.send_wire(msg).await;
                }
            }
            Err(err) => {
                let code = if err.kind == RfbErrorKind::ProtocolError {
                    1002
                } else {
                    1000
                };
                self.detach_and_close(code, "handshake failed").await;
                self.fail_session(err).await;
            }
        }
    }

    fn on_connected(&mut self, width: u16, height: u16, server_name: String) {
        info!("connected to '{}' ({}x{})", server_name, width, height);
        self.connect_deadline = None;
        self.state.connected = true;
        self.state.connecting = false;
        self.state.error = None;
        self.state.width = width;
        self.state.height = height;
        self.state.server_name = Some(server_name);
        self.reconnect_attempts = 0;
        self.was_connected = true;
        self.stats.connected_at = Some(Utc::now().to_rfc3339());
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    async fn handle_close(&mut self, code: u16, reason: String) {
        debug!("transport closed: code {} reason {:?}", code, reason);
        self.transport = None;
        self.machine = None;
        self.connect_deadline = None;

        let err = RfbError::from_close_code(code, &reason);
        let eligible = self.was_connected
            && code == 1006
            && self.reconnect_attempts < self.options.max_reconnect_attempts;

        if let Some(err) = err.as_ref() {
            self.state.error = Some(err.message.clone());
            self.publish(Event::Error {
                message: err.message.clone(),
            });
        }

        let was_active = self.state.connected || self.state.connecting;
        self.state.connected = false;
        self.state.connecting = false;
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(err
                .clone()
                .unwrap_or_else(|| RfbError::transport("connection closed during handshake"))));
        }
        if was_active {
            self.publish(Event::Disconnected);
        }

        if eligible {
            self.reconnect_attempts += 1;
            let backoff = backoff_ms(self.reconnect_attempts);
            info!(
                "scheduling reconnect attempt {} in {} ms",
                self.reconnect_attempts, backoff
            );
            self.reconnect_timer = Some(Box::pin(sleep_until(
                Instant::now() + Duration::from_millis(backoff),
            )));
        } else {
            // 1002 and 1003 halt reconnection permanently; every other
            // non-eligible code simply ends the cycle.
            self.was_connected = false;
        }
    }

    async fn handle_connect_timeout(&mut self) {
        self.connect_deadline = None;
        if !self.state.connecting {
            return;
        }
        self.detach_and_close(1000, "connect timeout").await;
        self.fail_session(RfbError::timeout("connect deadline elapsed"))
            .await;
    }

    // ── Terminal transitions ────────────────────────────────────────

    /// Terminal failure: surface the error, cancel timers, end in
    /// `Disconnected` with no retry.
    async fn fail_session(&mut self, err: RfbError) {
        warn!("session failed: {}", err);
        self.state.error = Some(err.message.clone());
        self.publish(Event::Error {
            message: err.message.clone(),
        });

        self.connect_deadline = None;
        self.reconnect_timer = None;
        self.transport = None;
        self.machine = None;
        self.was_connected = false;

        let was_active = self.state.connected || self.state.connecting;
        self.state.connected = false;
        self.state.connecting = false;
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(err));
        }
        if was_active {
            self.publish(Event::Disconnected);
        }
    }

    /// Explicit disconnect: cancel timers, detach before closing so the
    /// close event cannot trigger reconnection, zero the counter, and
    /// emit `Disconnected` once.
    async fn user_disconnect(&mut self) {
        self.connect_deadline = None;
        self.reconnect_timer = None;
        self.reconnect_attempts = 0;
        self.was_connected = false;

        let was_active = self.state.connected || self.state.connecting;
        self.detach_and_close(1000, "client disconnect").await;
        self.machine = None;
        self.state.connected = false;
        self.state.connecting = false;
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(RfbError::transport("cancelled by disconnect")));
        }
        if was_active {
            self.publish(Event::Disconnected);
        }
    }

    /// Send a close frame, then drop the handle. Dropping detaches both
    /// directions, so whatever the pump does afterwards is unobserved.
    async fn detach_and_close(&mut self, code: u16, reason: &str) {
        if let Some(transport) = self.transport.take() {
            let _ = transport
                .tx
                .send(WireCommand::Close {
                    code,
                    reason: reason.into(),
                })
                .await;
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn input_allowed(&self) -> bool {
        !self.options.view_only && self.is_protocol_connected()
    }

    fn is_protocol_connected(&self) -> bool {
        self.machine
            .as_ref()
            .map(ProtocolMachine::is_connected)
            .unwrap_or(false)
    }

    async fn send_wire(&mut self, bytes: Vec<u8>) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        let len = bytes.len() as u64;
        if transport.tx.send(WireCommand::Send(bytes)).await.is_ok() {
            self.stats.bytes_sent += len;
            self.stats.last_activity = Some(Utc::now().to_rfc3339());
        }
    }

    fn publish(&mut self, event: Event) {
        self.bus.publish(&event);
    }

    fn arm_grace(&mut self) {
        self.grace_timer = Some(Box::pin(sleep_until(Instant::now() + TEARDOWN_GRACE)));
    }
}

async fn next_wake(
    cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    commands_open: bool,
    transport: Option<&mut TransportHandle>,
    connect_deadline: Option<&mut Pin<Box<Sleep>>>,
    reconnect_timer: Option<&mut Pin<Box<Sleep>>>,
    grace_timer: Option<&mut Pin<Box<Sleep>>>,
) -> Wake {
    let has_transport = transport.is_some();
    let has_deadline = connect_deadline.is_some();
    let has_reconnect = reconnect_timer.is_some();
    let has_grace = grace_timer.is_some();

    let mut transport = transport;
    let mut connect_deadline = connect_deadline;
    let mut reconnect_timer = reconnect_timer;
    let mut grace_timer = grace_timer;

    // Deterministic priority: timers, then inbound bytes, then user
    // commands.
    tokio::select! {
        biased;
        _ = async { connect_deadline.as_mut().unwrap().as_mut().await }, if has_deadline => {
            Wake::ConnectTimeout
        }
        _ = async { reconnect_timer.as_mut().unwrap().as_mut().await }, if has_reconnect => {
            Wake::ReconnectFire
        }
        _ = async { grace_timer.as_mut().unwrap().as_mut().await }, if has_grace => {
            Wake::GraceFire
        }
        ev = async { transport.as_mut().unwrap().rx.recv().await }, if has_transport => {
            Wake::Transport(ev)
        }
        cmd = cmd_rx.recv(), if commands_open => Wake::Command(cmd),
    }
}

fn endpoint_scheme_ok(endpoint: &str) -> bool {
    let lower = endpoint.to_ascii_lowercase();
    lower.starts_with("ws://") || lower.starts_with("wss://")
}

/// Exponential backoff: 1 s, 2 s, 4 s, ... capped at 10 s.
fn backoff_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(16);
    (RECONNECT_BASE_BACKOFF_MS << exp).min(RECONNECT_MAX_BACKOFF_MS)
}

/// Scale, floor, and clamp one pointer coordinate to the framebuffer.
fn clamp_coord(value: f64, extent: u16) -> u16 {
    if extent == 0 {
        return 0;
    }
    let floored = value.floor();
    if floored < 0.0 {
        return 0;
    }
    let max = extent - 1;
    if floored >= max as f64 {
        max
    } else {
        floored as u16
    }
}
