//! One shard: a long-lived gateway WebSocket and its session state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::close_code::GatewayCloseCode;
use super::decompressor::Decompressor;
use super::error::GatewayError;
use super::opcode::GatewayOpcode;
use crate::backoff::ExponentialBackoff;
use crate::config::ShardManagerOptions;
use crate::dispatcher::Dispatcher;
use crate::times_per::TimesPerWindow;
use crate::types::{
    GatewayPayload, Hello, Identify, IdentifyProperties, Ready, RequestGuildMembers, Resume,
    VoiceStateUpdate,
};
use crate::API_VERSION;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Outbound commands allowed per window, across all opcodes except
/// heartbeats.
const SEND_LIMIT: u32 = 120;
const SEND_WINDOW: Duration = Duration::from_secs(60);

/// Consecutive unacknowledged heartbeats before the connection is declared
/// dead.
const MAX_MISSED_ACKS: u8 = 2;

/// Close code used when this side abandons a connection it intends to
/// resume.
const RESUME_CLOSE_CODE: u16 = 4000;

/// Connection state of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShardState {
    /// Not connected and not trying to be.
    #[default]
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open, waiting for HELLO.
    HelloWait,
    /// HELLO received, heartbeat scheduled.
    Identifying,
    /// Replacing a connection with a known session.
    Resuming,
    /// IDENTIFY or RESUME sent, waiting for READY or RESUMED.
    ReadyWait,
    /// Live.
    Connected,
    /// A transient close happened; a reconnect is coming.
    Reconnecting,
}

/// Meta events dispatched on a shard's [`Shard::dispatcher`].
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// A payload was written to the socket.
    Sent(GatewayPayload),
    /// The connection closed. Non-fatal closes reconnect automatically.
    Disconnect {
        /// Close code, if the peer sent one.
        code: Option<u16>,
    },
    /// A fatal error; the shard has stopped.
    Critical(GatewayError),
    /// The shard moved between connection states.
    StateChange {
        /// Previous state.
        from: ShardState,
        /// New state.
        to: ShardState,
    },
}

#[derive(Debug, Default)]
struct SessionState {
    state: ShardState,
    session_id: Option<String>,
    resume_url: Option<String>,
    sequence: Option<u64>,
}

#[derive(Debug)]
enum Outbound {
    Command(GatewayPayload),
    Close { resumable: bool },
}

#[derive(Debug)]
struct ShardShared {
    shard_id: u16,
    shard_count: u16,
    intents: u64,
    token: String,
    gateway_url: String,
    presence: Option<Value>,
    large_threshold: Option<u32>,
    library_name: String,
    raw_dispatcher: Dispatcher<u8, GatewayPayload>,
    event_dispatcher: Dispatcher<String, Value>,
    dispatcher: Dispatcher<String, ShardEvent>,
    session: Mutex<SessionState>,
    latency: Mutex<Option<Duration>>,
    send_gate: TimesPerWindow,
    identify_gate: Arc<TimesPerWindow>,
    command_tx: mpsc::Sender<Outbound>,
    should_reconnect: AtomicBool,
}

/// A shard connection to the Discord gateway.
///
/// Incoming frames are dispatched on [`Shard::raw_dispatcher`] keyed by
/// opcode; DISPATCH events additionally on [`Shard::event_dispatcher`] keyed
/// by event name. Lifecycle events (`sent`, `disconnect`, `critical`,
/// `state_change`) go to [`Shard::dispatcher`]. Fatal conditions never
/// propagate into handler frames; they arrive as
/// [`ShardEvent::Critical`] values on the `critical` channel.
#[derive(Debug)]
pub struct Shard {
    shared: Arc<ShardShared>,
    command_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
}

impl Shard {
    /// Create a shard. `gateway_url` is the URL from `/gateway/bot`; the
    /// identify gate is shared between all shards of the same
    /// `shard_id % max_concurrency` bucket.
    #[must_use]
    pub fn new(
        shard_id: u16,
        shard_count: u16,
        gateway_url: String,
        options: &ShardManagerOptions,
        identify_gate: Arc<TimesPerWindow>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        Self {
            shared: Arc::new(ShardShared {
                shard_id,
                shard_count,
                intents: options.intents,
                token: options.token.clone(),
                gateway_url,
                presence: options.presence.clone(),
                large_threshold: options.large_threshold,
                library_name: options.library_name.clone(),
                raw_dispatcher: Dispatcher::new(),
                event_dispatcher: Dispatcher::new(),
                dispatcher: Dispatcher::new(),
                session: Mutex::new(SessionState::default()),
                latency: Mutex::new(None),
                send_gate: TimesPerWindow::new(SEND_LIMIT, SEND_WINDOW),
                identify_gate,
                command_tx,
                should_reconnect: AtomicBool::new(true),
            }),
            command_rx: Mutex::new(Some(command_rx)),
        }
    }

    /// This shard's id.
    #[must_use]
    pub fn shard_id(&self) -> u16 {
        self.shared.shard_id
    }

    /// The shard count this shard identifies with.
    #[must_use]
    pub fn shard_count(&self) -> u16 {
        self.shared.shard_count
    }

    /// Raw frames keyed by opcode.
    #[must_use]
    pub fn raw_dispatcher(&self) -> &Dispatcher<u8, GatewayPayload> {
        &self.shared.raw_dispatcher
    }

    /// DISPATCH payloads keyed by event name.
    #[must_use]
    pub fn event_dispatcher(&self) -> &Dispatcher<String, Value> {
        &self.shared.event_dispatcher
    }

    /// Lifecycle events: `sent`, `disconnect`, `critical`, `state_change`.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher<String, ShardEvent> {
        &self.shared.dispatcher
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ShardState {
        self.shared.session.lock().state
    }

    /// Session id of the current session, if READY has been received.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.shared.session.lock().session_id.clone()
    }

    /// Last received sequence number on this session.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.shared.session.lock().sequence
    }

    /// Time between the last heartbeat and its acknowledgement.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        *self.shared.latency.lock()
    }

    /// Allow or forbid automatic reconnects. When forbidden, the next
    /// reconnect attempt stops the shard with
    /// [`GatewayError::ReconnectCheckFailed`] on the `critical` channel.
    pub fn set_should_reconnect(&self, value: bool) {
        self.shared.should_reconnect.store(value, Ordering::Relaxed);
    }

    /// Start the connection supervisor. Returns once the shard has begun
    /// connecting, not once it is READY.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AlreadyConnected`] on a second call.
    pub fn connect(&self) -> Result<(), GatewayError> {
        let commands = self
            .command_rx
            .lock()
            .take()
            .ok_or(GatewayError::AlreadyConnected)?;
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_shard(shared, commands));
        Ok(())
    }

    /// Close the connection. `resumable` sends close code 1000 and keeps the
    /// session for a later resume; otherwise 1001 is sent and the session is
    /// cleared.
    pub async fn close(&self, resumable: bool) {
        let _ = self.shared.command_tx.send(Outbound::Close { resumable }).await;
    }

    /// Send a PRESENCE_UPDATE.
    ///
    /// # Errors
    ///
    /// Fails when the shard is not connected or the outbound gate is closed.
    pub async fn update_presence(&self, presence: Value) -> Result<(), GatewayError> {
        self.send_command(payload(GatewayOpcode::PresenceUpdate, presence)).await
    }

    /// Send a VOICE_STATE_UPDATE.
    ///
    /// # Errors
    ///
    /// Fails when the shard is not connected or the outbound gate is closed.
    pub async fn update_voice_state(&self, update: &VoiceStateUpdate) -> Result<(), GatewayError> {
        let data = serde_json::to_value(update).map_err(|e| GatewayError::Encode(e.to_string()))?;
        self.send_command(payload(GatewayOpcode::VoiceStateUpdate, data)).await
    }

    /// Send a REQUEST_GUILD_MEMBERS.
    ///
    /// # Errors
    ///
    /// Fails when the shard is not connected or the outbound gate is closed.
    pub async fn request_guild_members(
        &self,
        request: &RequestGuildMembers,
    ) -> Result<(), GatewayError> {
        let data = serde_json::to_value(request).map_err(|e| GatewayError::Encode(e.to_string()))?;
        self.send_command(payload(GatewayOpcode::RequestGuildMembers, data)).await
    }

    /// Queue an arbitrary command through the outbound rate limit gate.
    ///
    /// # Errors
    ///
    /// Fails when the shard is not connected or the outbound gate is closed.
    pub async fn send_command(&self, command: GatewayPayload) -> Result<(), GatewayError> {
        self.shared
            .send_gate
            .acquire()
            .await
            .map_err(|_| GatewayError::GateClosed)?;
        self.shared
            .command_tx
            .send(Outbound::Command(command))
            .await
            .map_err(|_| GatewayError::NotConnected)
    }
}

fn payload(op: GatewayOpcode, data: Value) -> GatewayPayload {
    GatewayPayload {
        op: op as u8,
        d: Some(data),
        s: None,
        t: None,
    }
}

impl ShardShared {
    fn set_state(&self, to: ShardState) {
        let from = {
            let mut session = self.session.lock();
            if session.state == to {
                return;
            }
            let from = session.state;
            session.state = to;
            from
        };
        debug!(shard_id = self.shard_id, ?from, ?to, "shard state change");
        let _completion = self
            .dispatcher
            .dispatch("state_change".to_owned(), ShardEvent::StateChange { from, to });
    }

    fn clear_session(&self) {
        let mut session = self.session.lock();
        session.session_id = None;
        session.resume_url = None;
        session.sequence = None;
    }

    fn connect_url(&self) -> String {
        let base = {
            let session = self.session.lock();
            session
                .resume_url
                .clone()
                .unwrap_or_else(|| self.gateway_url.clone())
        };
        format!(
            "{}/?v={API_VERSION}&encoding=json&compress=zlib-stream",
            base.trim_end_matches('/')
        )
    }

    fn dispatch_meta(&self, key: &str, event: ShardEvent) {
        let _completion = self.dispatcher.dispatch(key.to_owned(), event);
    }
}

enum ConnectionOutcome {
    Reconnect { resumable: bool },
    Fatal(GatewayError),
    Closed,
}

async fn run_shard(shared: Arc<ShardShared>, mut commands: mpsc::Receiver<Outbound>) {
    let mut backoff = ExponentialBackoff::new(0.5, 2.0, 10.0);
    loop {
        backoff.wait().await;
        shared.set_state(ShardState::Connecting);
        let url = shared.connect_url();
        debug!(shard_id = shared.shard_id, url = %url, "connecting to the gateway");

        let socket = match connect_async(&url).await {
            Ok((socket, _)) => {
                backoff.reset();
                socket
            }
            Err(e) => {
                warn!(shard_id = shared.shard_id, error = %e, "failed to reach the gateway");
                shared.set_state(ShardState::Disconnected);
                continue;
            }
        };

        match run_connection(&shared, socket, &mut commands).await {
            ConnectionOutcome::Reconnect { resumable } => {
                if !resumable {
                    shared.clear_session();
                }
                shared.set_state(ShardState::Reconnecting);
                if !shared.should_reconnect.load(Ordering::Relaxed) {
                    shared.dispatch_meta(
                        "critical",
                        ShardEvent::Critical(GatewayError::ReconnectCheckFailed),
                    );
                    shared.set_state(ShardState::Disconnected);
                    return;
                }
            }
            ConnectionOutcome::Fatal(e) => {
                error!(shard_id = shared.shard_id, error = %e, "fatal gateway error, stopping shard");
                shared.set_state(ShardState::Disconnected);
                shared.dispatch_meta("critical", ShardEvent::Critical(e));
                return;
            }
            ConnectionOutcome::Closed => {
                info!(shard_id = shared.shard_id, "shard closed");
                shared.set_state(ShardState::Disconnected);
                return;
            }
        }
    }
}

async fn run_connection(
    shared: &Arc<ShardShared>,
    socket: WsStream,
    commands: &mut mpsc::Receiver<Outbound>,
) -> ConnectionOutcome {
    shared.set_state(ShardState::HelloWait);
    let (mut write, mut read) = socket.split();
    let mut decompressor = Decompressor::new();
    *shared.latency.lock() = None;

    let hello = match wait_for_hello(shared, &mut read, &mut decompressor).await {
        Ok(hello) => hello,
        Err(outcome) => return outcome,
    };
    let heartbeat_interval = Duration::from_millis(hello.heartbeat_interval);
    shared.set_state(ShardState::Identifying);

    let resume_info = {
        let session = shared.session.lock();
        session.session_id.clone().zip(session.sequence)
    };
    if let Some((session_id, seq)) = resume_info {
        // Resumes do not count against the IDENTIFY limit, so prefer them.
        shared.set_state(ShardState::Resuming);
        info!(shard_id = shared.shard_id, %session_id, seq, "resuming session");
        let resume = Resume {
            token: shared.token.clone(),
            session_id,
            seq,
        };
        let frame = match encode(GatewayOpcode::Resume, &resume) {
            Ok(frame) => frame,
            Err(e) => return ConnectionOutcome::Fatal(e),
        };
        if let Err(e) = send_frame(shared, &mut write, frame).await {
            warn!(shard_id = shared.shard_id, error = %e, "failed to send RESUME");
            return ConnectionOutcome::Reconnect { resumable: true };
        }
    } else {
        if shared.identify_gate.acquire().await.is_err() {
            return ConnectionOutcome::Fatal(GatewayError::GateClosed);
        }
        info!(shard_id = shared.shard_id, "identifying");
        let identify = Identify {
            token: shared.token.clone(),
            properties: IdentifyProperties {
                os: std::env::consts::OS.to_owned(),
                browser: shared.library_name.clone(),
                device: shared.library_name.clone(),
            },
            intents: shared.intents,
            shard: [shared.shard_id, shared.shard_count],
            compress: false,
            large_threshold: shared.large_threshold,
            presence: shared.presence.clone(),
        };
        let frame = match encode(GatewayOpcode::Identify, &identify) {
            Ok(frame) => frame,
            Err(e) => return ConnectionOutcome::Fatal(e),
        };
        if let Err(e) = send_frame(shared, &mut write, frame).await {
            warn!(shard_id = shared.shard_id, error = %e, "failed to send IDENTIFY");
            return ConnectionOutcome::Reconnect { resumable: true };
        }
    }
    shared.set_state(ShardState::ReadyWait);

    // Discord requires a random fraction of the interval before the first
    // heartbeat of a connection.
    let jitter: f64 = rand::random();
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + heartbeat_interval.mul_f64(jitter),
        heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut acked = true;
    let mut missed_acks: u8 = 0;
    let mut heartbeat_sent_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if acked {
                    missed_acks = 0;
                } else {
                    missed_acks += 1;
                    if missed_acks >= MAX_MISSED_ACKS {
                        warn!(
                            shard_id = shared.shard_id,
                            "{MAX_MISSED_ACKS} heartbeats unacknowledged, closing dead connection"
                        );
                        let _ = write
                            .send(close_message(RESUME_CLOSE_CODE, "heartbeat ack timeout"))
                            .await;
                        return ConnectionOutcome::Reconnect { resumable: true };
                    }
                }
                let seq = shared.session.lock().sequence;
                let frame = GatewayPayload {
                    op: GatewayOpcode::Heartbeat as u8,
                    d: Some(seq.map_or(Value::Null, Value::from)),
                    s: None,
                    t: None,
                };
                acked = false;
                heartbeat_sent_at = Some(Instant::now());
                // Heartbeats bypass the send gate: missing one kills the
                // connection, briefly exceeding the command rate does not.
                if let Err(e) = send_frame(shared, &mut write, frame).await {
                    warn!(shard_id = shared.shard_id, error = %e, "failed to send heartbeat");
                    return ConnectionOutcome::Reconnect { resumable: true };
                }
            }

            command = commands.recv() => {
                match command {
                    Some(Outbound::Command(frame)) => {
                        if let Err(e) = send_frame(shared, &mut write, frame).await {
                            warn!(shard_id = shared.shard_id, error = %e, "failed to send command");
                            return ConnectionOutcome::Reconnect { resumable: true };
                        }
                    }
                    Some(Outbound::Close { resumable }) => {
                        let code = if resumable { 1000 } else { 1001 };
                        if !resumable {
                            shared.clear_session();
                        }
                        let _ = write.send(close_message(code, "closing")).await;
                        return ConnectionOutcome::Closed;
                    }
                    None => return ConnectionOutcome::Closed,
                }
            }

            message = read.next() => {
                match message {
                    Some(Ok(msg)) => match decode_message(msg, &mut decompressor) {
                        Decoded::Frame(frame) => {
                            match process_frame(
                                shared,
                                frame,
                                &mut acked,
                                &mut missed_acks,
                                heartbeat_sent_at,
                            ) {
                                FrameAction::Continue => {}
                                FrameAction::Send(reply) => {
                                    if let Err(e) = send_frame(shared, &mut write, reply).await {
                                        warn!(shard_id = shared.shard_id, error = %e, "failed to send reply");
                                        return ConnectionOutcome::Reconnect { resumable: true };
                                    }
                                }
                                FrameAction::CloseThen { code, outcome } => {
                                    let _ = write.send(close_message(code, "reconnecting")).await;
                                    return outcome;
                                }
                            }
                        }
                        Decoded::Close(code) => return classify_close(shared, code),
                        Decoded::Skip => {}
                        Decoded::Corrupt(e) => {
                            // The zlib context is shot; nothing later on this
                            // connection would decompress.
                            error!(shard_id = shared.shard_id, error = %e, "corrupted gateway stream");
                            return ConnectionOutcome::Reconnect { resumable: true };
                        }
                    },
                    Some(Err(e)) => {
                        warn!(shard_id = shared.shard_id, error = %e, "websocket error");
                        shared.dispatch_meta("disconnect", ShardEvent::Disconnect { code: None });
                        return ConnectionOutcome::Reconnect { resumable: true };
                    }
                    None => return classify_close(shared, None),
                }
            }
        }
    }
}

async fn wait_for_hello(
    shared: &Arc<ShardShared>,
    read: &mut WsSource,
    decompressor: &mut Decompressor,
) -> Result<Hello, ConnectionOutcome> {
    loop {
        match read.next().await {
            Some(Ok(msg)) => match decode_message(msg, decompressor) {
                Decoded::Frame(frame) => {
                    if frame.op != GatewayOpcode::Hello as u8 {
                        warn!(shard_id = shared.shard_id, op = frame.op, "expected HELLO");
                        return Err(ConnectionOutcome::Reconnect { resumable: true });
                    }
                    let data = frame.d.clone().unwrap_or_default();
                    let _completion = shared.raw_dispatcher.dispatch(frame.op, frame);
                    match serde_json::from_value::<Hello>(data) {
                        Ok(hello) => return Ok(hello),
                        Err(e) => {
                            warn!(shard_id = shared.shard_id, error = %e, "malformed HELLO");
                            return Err(ConnectionOutcome::Reconnect { resumable: true });
                        }
                    }
                }
                Decoded::Close(code) => return Err(classify_close(shared, code)),
                Decoded::Skip => {}
                Decoded::Corrupt(e) => {
                    error!(shard_id = shared.shard_id, error = %e, "corrupted gateway stream");
                    return Err(ConnectionOutcome::Reconnect { resumable: true });
                }
            },
            Some(Err(e)) => {
                warn!(shard_id = shared.shard_id, error = %e, "websocket error before HELLO");
                return Err(ConnectionOutcome::Reconnect { resumable: true });
            }
            None => return Err(ConnectionOutcome::Reconnect { resumable: true }),
        }
    }
}

enum Decoded {
    Frame(GatewayPayload),
    Close(Option<u16>),
    Skip,
    Corrupt(String),
}

fn decode_message(msg: Message, decompressor: &mut Decompressor) -> Decoded {
    match msg {
        Message::Text(text) => parse_frame(text.as_str().as_bytes()),
        Message::Binary(data) => match decompressor.decompress(&data) {
            Ok(Some(bytes)) => parse_frame(&bytes),
            Ok(None) => Decoded::Skip,
            Err(e) => Decoded::Corrupt(e.to_string()),
        },
        Message::Close(frame) => Decoded::Close(frame.map(|f| u16::from(f.code))),
        _ => Decoded::Skip,
    }
}

fn parse_frame(bytes: &[u8]) -> Decoded {
    match serde_json::from_slice::<GatewayPayload>(bytes) {
        Ok(frame) => Decoded::Frame(frame),
        Err(e) => {
            warn!(error = %e, "failed to parse gateway payload");
            Decoded::Skip
        }
    }
}

enum FrameAction {
    Continue,
    Send(GatewayPayload),
    CloseThen {
        code: u16,
        outcome: ConnectionOutcome,
    },
}

fn process_frame(
    shared: &Arc<ShardShared>,
    frame: GatewayPayload,
    acked: &mut bool,
    missed_acks: &mut u8,
    heartbeat_sent_at: Option<Instant>,
) -> FrameAction {
    if let Some(seq) = frame.s {
        let mut session = shared.session.lock();
        session.sequence = Some(session.sequence.map_or(seq, |current| current.max(seq)));
    }

    let _completion = shared.raw_dispatcher.dispatch(frame.op, frame.clone());

    match GatewayOpcode::try_from(frame.op) {
        Ok(GatewayOpcode::Dispatch) => {
            let name = frame.t.clone().unwrap_or_default();
            let data = frame.d.clone().unwrap_or(Value::Null);
            match name.as_str() {
                "READY" => match serde_json::from_value::<Ready>(data.clone()) {
                    Ok(ready) => {
                        info!(
                            shard_id = shared.shard_id,
                            session_id = %ready.session_id,
                            "gateway ready"
                        );
                        let mut session = shared.session.lock();
                        session.session_id = Some(ready.session_id);
                        session.resume_url = Some(ready.resume_gateway_url);
                        drop(session);
                        shared.set_state(ShardState::Connected);
                    }
                    Err(e) => warn!(shard_id = shared.shard_id, error = %e, "malformed READY"),
                },
                "RESUMED" => {
                    info!(shard_id = shared.shard_id, "session resumed");
                    shared.set_state(ShardState::Connected);
                }
                _ => {}
            }
            let _completion = shared.event_dispatcher.dispatch(name, data);
            FrameAction::Continue
        }
        Ok(GatewayOpcode::Heartbeat) => {
            // The server asked for an immediate beat.
            let seq = shared.session.lock().sequence;
            FrameAction::Send(GatewayPayload {
                op: GatewayOpcode::Heartbeat as u8,
                d: Some(seq.map_or(Value::Null, Value::from)),
                s: None,
                t: None,
            })
        }
        Ok(GatewayOpcode::HeartbeatAck) => {
            *acked = true;
            *missed_acks = 0;
            if let Some(sent_at) = heartbeat_sent_at {
                *shared.latency.lock() = Some(sent_at.elapsed());
            }
            FrameAction::Continue
        }
        Ok(GatewayOpcode::Reconnect) => {
            info!(shard_id = shared.shard_id, "gateway requested a reconnect");
            FrameAction::CloseThen {
                code: RESUME_CLOSE_CODE,
                outcome: ConnectionOutcome::Reconnect { resumable: true },
            }
        }
        Ok(GatewayOpcode::InvalidSession) => {
            let resumable = frame.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
            warn!(shard_id = shared.shard_id, resumable, "session invalidated");
            FrameAction::CloseThen {
                code: RESUME_CLOSE_CODE,
                outcome: ConnectionOutcome::Reconnect { resumable },
            }
        }
        _ => {
            debug!(shard_id = shared.shard_id, op = frame.op, "unhandled opcode");
            FrameAction::Continue
        }
    }
}

fn classify_close(shared: &Arc<ShardShared>, code: Option<u16>) -> ConnectionOutcome {
    debug!(shard_id = shared.shard_id, ?code, "gateway connection closed");
    shared.dispatch_meta("disconnect", ShardEvent::Disconnect { code });

    let Some(code) = code else {
        return ConnectionOutcome::Reconnect { resumable: true };
    };
    if let Some(fatal) = GatewayError::from_close_code(code) {
        return ConnectionOutcome::Fatal(fatal);
    }
    let resumable = GatewayCloseCode::from_code(code).is_none_or(|known| !known.clears_session());
    ConnectionOutcome::Reconnect { resumable }
}

fn encode<T: serde::Serialize>(op: GatewayOpcode, data: &T) -> Result<GatewayPayload, GatewayError> {
    let data = serde_json::to_value(data).map_err(|e| GatewayError::Encode(e.to_string()))?;
    Ok(payload(op, data))
}

async fn send_frame(
    shared: &Arc<ShardShared>,
    write: &mut WsSink,
    frame: GatewayPayload,
) -> Result<(), GatewayError> {
    let text = serde_json::to_string(&frame).map_err(|e| GatewayError::Encode(e.to_string()))?;
    debug!(shard_id = shared.shard_id, op = frame.op, "sending frame");
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;
    shared.dispatch_meta("sent", ShardEvent::Sent(frame));
    Ok(())
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    }))
}
