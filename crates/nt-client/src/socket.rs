//! The WebSocket transport: connect/reconnect, heartbeat, RTT sampling, and
//! server-time projection (§4.1).

use crate::config::{ClientConfig, SUBPROTOCOL};
use futures_util::{SinkExt, StreamExt};
use nt_protocol::{BinaryFrame, ControlMessage};
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("invalid URL '{0}': {1}")]
    InvalidUrl(String, String),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("binary frame error: {0}")]
    Frame(#[from] nt_protocol::FrameError),
}

/// An inbound event the socket delivers to its driver (the Messenger).
#[derive(Debug)]
pub enum SocketEvent {
    Open,
    Close,
    /// A parsed text frame: the raw JSON array elements, still untyped so
    /// the caller can warn-and-skip entries that don't match the schema.
    Text(Vec<serde_json::Value>),
    Binary(Vec<BinaryFrame>),
}

enum SocketCommand {
    SendText(String),
    SendBinary(Vec<u8>),
    Close,
    Reinstantiate(String),
}

/// A disposer for [`Socket::add_connection_listener`]; dropping it (or
/// calling [`ListenerHandle::dispose`]) stops further callback invocations.
pub struct ListenerHandle {
    task: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    pub fn dispose(self) {
        self.task.abort();
    }
}

#[derive(Debug, Default)]
struct RttState {
    last_heartbeat_send_micros: u64,
    best_rtt_micros: Option<u64>,
    offset_micros: i64,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as u64
}

/// Public handle to a running socket. Cheap to clone; all clones share the
/// same underlying connection and event stream.
#[derive(Clone)]
pub struct Socket {
    cmd_tx: mpsc::UnboundedSender<SocketCommand>,
    connected_rx: watch::Receiver<bool>,
    rtt: Arc<RwLock<RttState>>,
    events_rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>>,
}

impl Socket {
    /// Open a connection to `config.url` and start the background
    /// connect/reconnect/heartbeat loop.
    pub fn connect(config: ClientConfig) -> Socket {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let rtt = Arc::new(RwLock::new(RttState::default()));

        let task_rtt = rtt.clone();
        tokio::spawn(run(config, cmd_rx, connected_tx, events_tx, task_rtt));

        Socket {
            cmd_tx,
            connected_rx,
            rtt,
            events_rx: Arc::new(tokio::sync::Mutex::new(Some(events_rx))),
        }
    }

    /// Take ownership of the event stream. Only the Messenger is expected to
    /// call this, exactly once, right after construction.
    pub async fn take_events(&self) -> mpsc::UnboundedReceiver<SocketEvent> {
        self.events_rx
            .lock()
            .await
            .take()
            .expect("socket events already taken")
    }

    pub fn connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Resolve as soon as OPEN is observed.
    pub async fn wait_for_connection(&self) {
        let mut rx = self.connected_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Register a connection listener; if `immediate`, it is invoked once
    /// right away with the current state before observing transitions.
    pub fn add_connection_listener(
        &self,
        immediate: bool,
        mut callback: impl FnMut(bool) + Send + 'static,
    ) -> ListenerHandle {
        let mut rx = self.connected_rx.clone();
        if immediate {
            callback(*rx.borrow());
        }
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                callback(*rx.borrow());
            }
        });
        ListenerHandle { task }
    }

    /// Send a single control message, wrapped as its own one-element JSON
    /// array text frame (§6).
    pub fn send_text(&self, msg: &ControlMessage) {
        if let Ok(text) = nt_protocol::control::encode_single(msg) {
            let _ = self.cmd_tx.send(SocketCommand::SendText(text));
        }
    }

    fn send_binary_frame(&self, frame: &BinaryFrame) -> Result<(), SocketError> {
        let bytes = frame.encode()?;
        let _ = self.cmd_tx.send(SocketCommand::SendBinary(bytes));
        Ok(())
    }

    /// Encode and send a value update for an announced topic id, returning
    /// the timestamp used, or `-1` if the socket is not currently connected
    /// (the frame is dropped, per §4.1).
    pub fn send_value_to_topic(
        &self,
        id: i64,
        value: &nt_protocol::Value,
        type_info: &nt_protocol::TypeInfo,
    ) -> i64 {
        if !self.connected() {
            return -1;
        }
        let timestamp = self.get_server_time().ceil() as i64;
        let frame = BinaryFrame::new(id, timestamp as u64, type_info.number, value.encode());
        let _ = self.send_binary_frame(&frame);
        timestamp
    }

    /// `local_micros − offset + best_rtt/2` (half-RTT term omitted until a
    /// sample has been taken).
    pub fn get_server_time(&self) -> f64 {
        let rtt = self.rtt.read().unwrap();
        let local = now_micros() as f64;
        let projected = local - rtt.offset_micros as f64;
        match rtt.best_rtt_micros {
            Some(best) => projected + (best as f64) / 2.0,
            None => projected,
        }
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(SocketCommand::Close);
    }

    /// Close the current connection (if any) and reconnect to `url`.
    pub fn reinstantiate(&self, url: impl Into<String>) {
        let _ = self.cmd_tx.send(SocketCommand::Reinstantiate(url.into()));
    }
}

fn build_request(
    url: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SocketError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SocketError::InvalidUrl(url.to_owned(), e.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        SUBPROTOCOL
            .parse()
            .expect("subprotocol constant is a valid header value"),
    );
    Ok(request)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run(
    mut config: ClientConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
    connected_tx: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    rtt: Arc<RwLock<RttState>>,
) {
    let auto_reconnect = Arc::new(AtomicBool::new(config.auto_reconnect));

    'reconnect: loop {
        let ws = match tokio_tungstenite::connect_async(match build_request(&config.url) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "invalid NT4 url, giving up");
                return;
            }
        })
        .await
        {
            Ok((ws, _response)) => ws,
            Err(e) => {
                tracing::warn!(error = %e, url = %config.url, "connect failed, retrying");
                if events_tx.send(SocketEvent::Close).is_err() {
                    return;
                }
                tokio::time::sleep(config.reconnect_delay).await;
                if !auto_reconnect.load(Ordering::Relaxed) {
                    return;
                }
                continue 'reconnect;
            }
        };

        let (mut write, mut read) = ws.split();

        // onOpen (the Messenger's replay, driven off this event) is notified
        // before any connection-status listener observes OPEN, per §4.1.
        // Frames sent while CONNECTING already sat in `cmd_rx` — the
        // unbounded channel backing `Socket::send_*` is the FIFO queue; there
        // is no separate flush step once the socket is writable.
        if events_tx.send(SocketEvent::Open).is_err() {
            return;
        }
        let _ = connected_tx.send(true);

        let mut heartbeat = tokio::time::interval(config.heartbeat_period);
        heartbeat.tick().await; // first tick fires immediately; discard it

        let close_reason = loop {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => break CloseReason::Dropped,
                        Some(SocketCommand::SendText(text)) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                break CloseReason::Error;
                            }
                        }
                        Some(SocketCommand::SendBinary(bytes)) => {
                            if write.send(Message::Binary(bytes.into())).await.is_err() {
                                break CloseReason::Error;
                            }
                        }
                        Some(SocketCommand::Close) => {
                            let _ = write.send(Message::Close(None)).await;
                            break CloseReason::UserClosed;
                        }
                        Some(SocketCommand::Reinstantiate(url)) => {
                            config.url = url;
                            let _ = write.send(Message::Close(None)).await;
                            break CloseReason::Reinstantiate;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let local = now_micros();
                    let frame = BinaryFrame::new(-1, local, 1, rmpv::Value::F64(local as f64));
                    if let Ok(bytes) = frame.encode() {
                        if write.send(Message::Binary(bytes.into())).await.is_err() {
                            break CloseReason::Error;
                        }
                        rtt.write().unwrap().last_heartbeat_send_micros = local;
                    }
                }
                msg = read.next() => {
                    match msg {
                        None => break CloseReason::Error,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "transport error");
                            break CloseReason::Error;
                        }
                        Some(Ok(Message::Text(text))) => {
                            match nt_protocol::control::decode_frame(text.as_str()) {
                                Ok(values) => {
                                    if events_tx.send(SocketEvent::Text(values)).is_err() {
                                        break CloseReason::Dropped;
                                    }
                                }
                                Err(e) => tracing::warn!(error = %e, "malformed control frame"),
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            match BinaryFrame::decode_all(&bytes) {
                                Ok(frames) => {
                                    let mut deliverable = Vec::new();
                                    for frame in frames {
                                        if frame.topic_id == -1 {
                                            handle_heartbeat_reply(&rtt, &frame);
                                        } else {
                                            deliverable.push(frame);
                                        }
                                    }
                                    if !deliverable.is_empty()
                                        && events_tx.send(SocketEvent::Binary(deliverable)).is_err()
                                    {
                                        break CloseReason::Dropped;
                                    }
                                }
                                Err(e) => tracing::warn!(error = %e, "malformed binary frame"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => break CloseReason::Error,
                        Some(Ok(_)) => {}
                    }
                }
            }
        };

        let _ = connected_tx.send(false);
        if events_tx.send(SocketEvent::Close).is_err() {
            return;
        }

        match close_reason {
            CloseReason::Dropped => return,
            CloseReason::UserClosed => {
                if !auto_reconnect.load(Ordering::Relaxed) {
                    return;
                }
                tokio::time::sleep(config.reconnect_delay).await;
                continue 'reconnect;
            }
            CloseReason::Reinstantiate => continue 'reconnect,
            CloseReason::Error => {
                if !auto_reconnect.load(Ordering::Relaxed) {
                    return;
                }
                tokio::time::sleep(config.reconnect_delay).await;
                continue 'reconnect;
            }
        }
    }
}

enum CloseReason {
    Dropped,
    UserClosed,
    Reinstantiate,
    Error,
}

fn handle_heartbeat_reply(rtt: &Arc<RwLock<RttState>>, frame: &BinaryFrame) {
    let local = now_micros();
    let mut state = rtt.write().unwrap();
    apply_heartbeat_reply(&mut state, local, frame.server_time);
}

/// The RTT update rule (§4.1/§8): best_rtt only decreases (or is set from
/// unset); offset is only updated when best_rtt is updated.
fn apply_heartbeat_reply(state: &mut RttState, local_now: u64, server_time: u64) {
    let measured_rtt = local_now.saturating_sub(state.last_heartbeat_send_micros);
    let improved = match state.best_rtt_micros {
        None => true,
        Some(best) => measured_rtt < best,
    };
    if improved {
        state.best_rtt_micros = Some(measured_rtt);
        state.offset_micros = local_now as i64 - server_time as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_rtt_matches_literal_scenario() {
        let mut state = RttState {
            last_heartbeat_send_micros: 100,
            ..Default::default()
        };
        apply_heartbeat_reply(&mut state, 150, 123);
        assert_eq!(state.best_rtt_micros, Some(50));
        assert_eq!(state.offset_micros, 27);

        state.last_heartbeat_send_micros = 200;
        apply_heartbeat_reply(&mut state, 250, 300);
        assert_eq!(state.best_rtt_micros, Some(50), "rtt of 50 is not < best, state unchanged");
        assert_eq!(state.offset_micros, 27);
    }

    #[test]
    fn rtt_unset_is_always_improved_on_first_sample() {
        let mut state = RttState::default();
        assert_eq!(state.best_rtt_micros, None);
        apply_heartbeat_reply(&mut state, 1_000, 900);
        assert_eq!(state.best_rtt_micros, Some(1_000));
    }
}
