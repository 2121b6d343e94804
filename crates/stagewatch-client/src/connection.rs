use crate::policy::ReconnectPolicy;
use crate::queue::OutboundQueue;
use crate::registry::{ClientEvent, ListenerRegistry, Subscription, Topic};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use stagewatch_core::{
    encode_control, normalize_text, ControlMessage, ControlSink, SimEvent, NORMAL_CLOSE_CODE,
};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "ws://127.0.0.1:8000/ws/simulation";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const NO_STATUS_CODE: u16 = 1005;
const ABNORMAL_CLOSE_CODE: u16 = 1006;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            "connecting" => Ok(ConnectionStatus::Connecting),
            "connected" | "open" => Ok(ConnectionStatus::Connected),
            "closing" => Ok(ConnectionStatus::Closing),
            "closed" => Ok(ConnectionStatus::Closed),
            other => Err(format!("Unknown connection status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("invalid connection url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
}

/// `{base_url}/{session_id}?client_id={client_id}`
pub fn connection_target(base_url: &str, session_id: &str, client_id: &str) -> Result<Url, ConnectError> {
    let invalid = |reason: String| ConnectError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };
    let mut url = Url::parse(base_url.trim()).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConnectError::UnsupportedScheme(url.scheme().to_string()));
    }
    url.path_segments_mut()
        .map_err(|_| invalid("url cannot carry a path".to_string()))?
        .pop_if_empty()
        .push(session_id);
    url.query_pairs_mut().append_pair("client_id", client_id);
    Ok(url)
}

enum Command {
    Send(String),
    Reconnect,
    Disconnect,
}

struct Driver {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    // Raised before any stop command so a timer or handshake finishing in the
    // meantime cannot bring the socket back.
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Driver {
    fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

#[derive(Default)]
struct ManagerState {
    driver: Option<Driver>,
    // Messages issued before any session was opened; encoded once the session id is known.
    backlog: Vec<ControlMessage>,
    last_session: Option<String>,
}

/// One logical websocket per session. All socket I/O, timers and the outbound
/// queue live in a single driver task; this handle only talks to it through a channel.
pub struct ConnectionManager {
    client_id: String,
    config: ConnectionConfig,
    registry: ListenerRegistry,
    status: Arc<watch::Sender<ConnectionStatus>>,
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            client_id: Uuid::new_v4().to_string(),
            config,
            registry: ListenerRegistry::new(),
            status: Arc::new(status),
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock_state().last_session.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.registry.on(topic, handler)
    }

    pub fn off(&self, subscription: Subscription) -> bool {
        self.registry.off(subscription)
    }

    /// Starts the driver for `session_id`. Connection problems never surface
    /// here; they feed the reconnect cycle and the `error`/`close` topics.
    pub fn open(&self, session_id: &str) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!("ws_open_error: {err}");
                return;
            }
        };
        let mut state = self.lock_state();
        if let Some(driver) = state.driver.as_ref() {
            if driver.session_id == session_id && !driver.handle.is_finished() {
                return;
            }
        }
        if let Some(previous) = state.driver.take() {
            debug!("ws_session_switch: from={} to={session_id}", previous.session_id);
            previous.stop();
            previous.handle.abort();
        }

        let mut queue = OutboundQueue::new();
        let backlog = std::mem::take(&mut state.backlog);
        queue.extend(
            backlog
                .into_iter()
                .filter_map(|msg| encode_frame(session_id, &self.client_id, msg)),
        );

        let (commands, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = DriverContext {
            session_id: session_id.to_string(),
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            status: Arc::clone(&self.status),
            shutdown: shutdown_rx,
        };
        let handle = runtime.spawn(drive(ctx, receiver, queue));
        state.last_session = Some(session_id.to_string());
        state.driver = Some(Driver {
            session_id: session_id.to_string(),
            commands,
            shutdown,
            handle,
        });
        info!("ws_open: session={session_id} client_id={}", self.client_id);
    }

    /// Sends now when connected, otherwise queues in submission order.
    pub fn send(&self, msg: ControlMessage) {
        let mut state = self.lock_state();
        let Some(driver) = state.driver.as_ref() else {
            state.backlog.push(msg);
            return;
        };
        let Some(frame) = encode_frame(&driver.session_id, &self.client_id, msg) else {
            return;
        };
        if driver.commands.send(Command::Send(frame)).is_err() {
            warn!("ws_send_dropped: driver stopped");
        }
    }

    /// Closes with the normal close code and stops automatic reconnection.
    pub fn disconnect(&self) {
        let Some(driver) = self.lock_state().driver.take() else {
            return;
        };
        driver.stop();
        publish_status(&self.status, &self.registry, ConnectionStatus::Closing);
        if driver.commands.send(Command::Disconnect).is_err() {
            driver.handle.abort();
            publish_status(&self.status, &self.registry, ConnectionStatus::Closed);
        }
    }

    /// Operator-initiated reconnect: resets the attempt counter, also after exhaustion.
    pub fn reconnect(&self) {
        let session_id = {
            let state = self.lock_state();
            if let Some(driver) = state.driver.as_ref() {
                if driver.commands.send(Command::Reconnect).is_ok() {
                    return;
                }
            }
            state.last_session.clone()
        };
        match session_id {
            Some(session_id) => self.open(&session_id),
            None => warn!("ws_reconnect_ignored: no session opened"),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = self.lock_state().driver.take() {
            driver.stop();
            driver.handle.abort();
        }
    }
}

impl ControlSink for ConnectionManager {
    fn send_control(&self, msg: ControlMessage) {
        self.send(msg);
    }
}

fn encode_frame(session_id: &str, client_id: &str, msg: ControlMessage) -> Option<String> {
    let kind = msg.kind();
    match encode_control(session_id, client_id, msg) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!("ws_encode_error: type={kind} {err}");
            None
        }
    }
}

fn publish_status(
    status: &watch::Sender<ConnectionStatus>,
    registry: &ListenerRegistry,
    next: ConnectionStatus,
) {
    let changed = status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        debug!("ws_state: {next}");
        registry.dispatch(&ClientEvent::StateChange(next));
    }
}

struct DriverContext {
    session_id: String,
    client_id: String,
    config: ConnectionConfig,
    registry: ListenerRegistry,
    status: Arc<watch::Sender<ConnectionStatus>>,
    shutdown: watch::Receiver<bool>,
}

impl DriverContext {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_status(&self, next: ConnectionStatus) {
        publish_status(&self.status, &self.registry, next);
    }

    fn emit(&self, event: ClientEvent) {
        self.registry.dispatch(&event);
    }

    fn frame(&self, msg: ControlMessage) -> Option<String> {
        encode_frame(&self.session_id, &self.client_id, msg)
    }
}

enum Flow {
    Retry,
    Stop,
}

enum Connect {
    Ready(WsStream),
    Failed,
    Stopped,
}

enum SessionEnd {
    Disconnected,
    Restart,
    Closed { code: u16, reason: String },
}

async fn drive(
    ctx: DriverContext,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut queue: OutboundQueue,
) {
    let mut attempt = 0u32;
    loop {
        if ctx.stopping() {
            break;
        }
        ctx.set_status(ConnectionStatus::Connecting);
        let flow = match connect(&ctx, &mut commands, &mut queue).await {
            Connect::Ready(ws) => {
                attempt = 0;
                match run_session(&ctx, ws, &mut commands, &mut queue).await {
                    SessionEnd::Disconnected => Flow::Stop,
                    SessionEnd::Restart => Flow::Retry,
                    SessionEnd::Closed { code, reason } => {
                        info!("ws_closed: code={code} reason={reason}");
                        ctx.emit(ClientEvent::Close { code, reason });
                        if code == NORMAL_CLOSE_CODE {
                            ctx.set_status(ConnectionStatus::Closed);
                            idle(&mut commands, &mut queue).await
                        } else {
                            ctx.set_status(ConnectionStatus::Disconnected);
                            backoff(&ctx, &mut attempt, &mut commands, &mut queue).await
                        }
                    }
                }
            }
            Connect::Failed => {
                ctx.set_status(ConnectionStatus::Disconnected);
                backoff(&ctx, &mut attempt, &mut commands, &mut queue).await
            }
            Connect::Stopped => Flow::Stop,
        };
        if let Flow::Stop = flow {
            break;
        }
    }
    ctx.set_status(ConnectionStatus::Closed);
    if !queue.is_empty() {
        debug!("ws_driver_stopped: unsent={}", queue.len());
    }
}

async fn connect(
    ctx: &DriverContext,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    queue: &mut OutboundQueue,
) -> Connect {
    let target = match connection_target(&ctx.config.base_url, &ctx.session_id, &ctx.client_id) {
        Ok(target) => target,
        Err(err) => {
            warn!("ws_target_error: {err}");
            ctx.emit(ClientEvent::Error(err.to_string()));
            return Connect::Failed;
        }
    };
    if ctx.stopping() {
        return Connect::Stopped;
    }
    let connecting = connect_async(target.as_str());
    tokio::pin!(connecting);
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => queue.push(frame),
                Some(Command::Reconnect) => {}
                Some(Command::Disconnect) | None => return Connect::Stopped,
            },
            result = &mut connecting => {
                return match result {
                    Ok((mut ws, _)) if ctx.stopping() => {
                        close_normal(&mut ws, "client disconnect").await;
                        Connect::Stopped
                    }
                    Ok((ws, _)) => Connect::Ready(ws),
                    Err(err) => {
                        warn!("ws_connect_error: {err}");
                        ctx.emit(ClientEvent::Error(err.to_string()));
                        Connect::Failed
                    }
                };
            }
        }
    }
}

async fn backoff(
    ctx: &DriverContext,
    attempt: &mut u32,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    queue: &mut OutboundQueue,
) -> Flow {
    let Some(delay) = ctx.config.reconnect.delay_for(*attempt) else {
        warn!("ws_reconnect_exhausted: attempts={attempt}");
        ctx.emit(ClientEvent::ReconnectExhausted { attempts: *attempt });
        let flow = idle(commands, queue).await;
        *attempt = 0;
        return flow;
    };
    *attempt += 1;
    info!(
        "ws_reconnect_scheduled: attempt={attempt} delay_ms={}",
        delay.as_millis()
    );
    ctx.emit(ClientEvent::ReconnectScheduled {
        attempt: *attempt,
        delay,
    });
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => queue.push(frame),
                Some(Command::Reconnect) => {
                    *attempt = 0;
                    return Flow::Retry;
                }
                Some(Command::Disconnect) | None => return Flow::Stop,
            },
            _ = &mut sleep => {
                if ctx.stopping() {
                    return Flow::Stop;
                }
                return Flow::Retry;
            }
        }
    }
}

/// Parked after a normal close or an exhausted retry budget: queue sends, wait for the operator.
async fn idle(commands: &mut mpsc::UnboundedReceiver<Command>, queue: &mut OutboundQueue) -> Flow {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Send(frame) => queue.push(frame),
            Command::Reconnect => return Flow::Retry,
            Command::Disconnect => return Flow::Stop,
        }
    }
    Flow::Stop
}

async fn run_session(
    ctx: &DriverContext,
    mut ws: WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    queue: &mut OutboundQueue,
) -> SessionEnd {
    if ctx.stopping() {
        close_normal(&mut ws, "client disconnect").await;
        return SessionEnd::Disconnected;
    }
    ctx.emit(ClientEvent::Open);
    while let Some(frame) = queue.pop() {
        if let Err(err) = ws.send(Message::Text(frame.clone())).await {
            warn!("ws_flush_error: {err}");
            queue.requeue_front(frame);
            return SessionEnd::Closed {
                code: ABNORMAL_CLOSE_CODE,
                reason: err.to_string(),
            };
        }
    }
    ctx.set_status(ConnectionStatus::Connected);
    info!("ws_connected: session={}", ctx.session_id);

    let period = ctx.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = ws.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("inbound_binary_frame: {err}");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                            .unwrap_or((NO_STATUS_CODE, String::new()));
                        return SessionEnd::Closed { code, reason };
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!("ws_read_error: {err}");
                        ctx.emit(ClientEvent::Error(err.to_string()));
                        // Transport failures end the session through the close path.
                        if matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_)) {
                            return SessionEnd::Closed {
                                code: ABNORMAL_CLOSE_CODE,
                                reason: err.to_string(),
                            };
                        }
                        continue;
                    }
                    None => {
                        return SessionEnd::Closed {
                            code: ABNORMAL_CLOSE_CODE,
                            reason: "stream ended".to_string(),
                        };
                    }
                };
                let Some(event) = normalize_text(&text, Utc::now()) else {
                    continue;
                };
                if let SimEvent::Heartbeat(payload) = &event.event {
                    let reply = ControlMessage::HeartbeatResponse {
                        server_time: payload.server_time.clone(),
                    };
                    if let Some(frame) = ctx.frame(reply) {
                        if let Err(err) = ws.send(Message::Text(frame)).await {
                            warn!("ws_heartbeat_response_error: {err}");
                        }
                    }
                }
                ctx.emit(ClientEvent::Sim(event));
            }
            _ = heartbeat.tick() => {
                if let Some(frame) = ctx.frame(ControlMessage::Ping) {
                    if let Err(err) = ws.send(Message::Text(frame)).await {
                        warn!("ws_ping_error: {err}");
                    }
                }
            }
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    if let Err(err) = ws.send(Message::Text(frame.clone())).await {
                        warn!("ws_send_error: {err}");
                        queue.push(frame);
                        return SessionEnd::Closed {
                            code: ABNORMAL_CLOSE_CODE,
                            reason: err.to_string(),
                        };
                    }
                }
                Some(Command::Reconnect) => {
                    close_normal(&mut ws, "reconnect requested").await;
                    ctx.emit(ClientEvent::Close {
                        code: NORMAL_CLOSE_CODE,
                        reason: "reconnect requested".to_string(),
                    });
                    return SessionEnd::Restart;
                }
                Some(Command::Disconnect) | None => {
                    ctx.set_status(ConnectionStatus::Closing);
                    close_normal(&mut ws, "client disconnect").await;
                    ctx.emit(ClientEvent::Close {
                        code: NORMAL_CLOSE_CODE,
                        reason: "client disconnect".to_string(),
                    });
                    return SessionEnd::Disconnected;
                }
            }
        }
    }
}

async fn close_normal(ws: &mut WsStream, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed(reason),
    };
    if let Err(err) = ws.close(Some(frame)).await {
        debug!("ws_close_error: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_appends_session_and_client_id() {
        let url = connection_target("ws://localhost:8000/ws/simulation", "sim-1", "client-a")
            .expect("target");
        assert_eq!(
            url.as_str(),
            "ws://localhost:8000/ws/simulation/sim-1?client_id=client-a"
        );

        let trailing = connection_target("wss://example.test/ws/", "sim 2", "c")
            .expect("target");
        assert_eq!(trailing.as_str(), "wss://example.test/ws/sim%202?client_id=c");
    }

    #[test]
    fn target_rejects_bad_urls() {
        assert!(matches!(
            connection_target("not a url", "sim-1", "c"),
            Err(ConnectError::InvalidUrl { .. })
        ));
        assert_eq!(
            connection_target("http://localhost/ws", "sim-1", "c"),
            Err(ConnectError::UnsupportedScheme("http".to_string()))
        );
    }

    #[test]
    fn client_ids_are_unique_per_manager() {
        let first = ConnectionManager::new(ConnectionConfig::default());
        let second = ConnectionManager::new(ConnectionConfig::default());
        assert_ne!(first.client_id(), second.client_id());
        assert_eq!(first.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Closing,
            ConnectionStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<ConnectionStatus>(), Ok(status));
        }
    }

    #[test]
    fn open_without_runtime_is_a_logged_no_op() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        manager.open("sim-1");
        manager.send(ControlMessage::Ping);
        assert_eq!(manager.session_id(), None);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }
}
