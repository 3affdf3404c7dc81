//! A mock NT4 server for testing client behavior.
//!
//! Binds to a random port, accepts WebSocket connections negotiating the
//! `networktables.first.wpi.edu` subprotocol, and hands each one to the test
//! as a [`MockNtConnection`] so the test can script announces/value pushes/
//! disconnects and assert on what the client sent.

use futures_util::{SinkExt, StreamExt};
use nt_protocol::{BinaryFrame, ControlMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

/// An event observed on a connection's read side.
#[derive(Debug)]
pub enum MockEvent {
    Text(Vec<serde_json::Value>),
    Binary(Vec<BinaryFrame>),
    Closed,
}

enum Command {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// One accepted client connection, as seen from the test.
pub struct MockNtConnection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_rx: mpsc::UnboundedReceiver<MockEvent>,
}

impl MockNtConnection {
    pub fn send_control(&self, msgs: &[ControlMessage]) {
        let text = serde_json::to_string(msgs).expect("control messages always serialize");
        let _ = self.cmd_tx.send(Command::Text(text));
    }

    pub fn send_binary_frames(&self, frames: &[BinaryFrame]) {
        let mut bytes = Vec::new();
        for frame in frames {
            bytes.extend(frame.encode().expect("frame always encodes"));
        }
        let _ = self.cmd_tx.send(Command::Binary(bytes));
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Wait for the next parsed event from the client. `None` once the
    /// connection task has exited.
    pub async fn recv_event(&mut self) -> Option<MockEvent> {
        self.event_rx.recv().await
    }

    /// Convenience: wait for the next batch of inbound control messages,
    /// ignoring binary frames in between.
    pub async fn recv_control(&mut self) -> Option<Vec<serde_json::Value>> {
        while let Some(event) = self.recv_event().await {
            if let MockEvent::Text(values) = event {
                return Some(values);
            }
        }
        None
    }

    /// Convenience: wait for the next batch of inbound binary frames,
    /// ignoring control messages in between.
    pub async fn recv_binary(&mut self) -> Option<Vec<BinaryFrame>> {
        while let Some(event) = self.recv_event().await {
            if let MockEvent::Binary(frames) = event {
                return Some(frames);
            }
        }
        None
    }
}

/// A mock NT4 server for integration tests. Binds a random port; each
/// accepted connection is delivered through [`MockNtServer::accept`].
pub struct MockNtServer {
    addr: std::net::SocketAddr,
    connections_rx: mpsc::UnboundedReceiver<MockNtConnection>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockNtServer {
    pub async fn start() -> std::io::Result<MockNtServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let connections_tx = connections_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, connections_tx).await {
                                tracing::debug!(error = %e, "mock connection ended");
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockNtServer {
            addr,
            connections_rx,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// The full `ws://127.0.0.1:<port>/nt/<client-id>`-compatible base URL a
    /// client can be pointed at directly via `ClientConfig::with_exact_url`.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Wait for the next client to connect.
    pub async fn accept(&mut self) -> Option<MockNtConnection> {
        self.connections_rx.recv().await
    }
}

async fn handle_connection(
    stream: TcpStream,
    connections_tx: mpsc::UnboundedSender<MockNtConnection>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let callback = |req: &Request, mut response: Response| {
        if let Some(protocol) = req.headers().get("Sec-WebSocket-Protocol") {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", protocol.clone());
        }
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws.split();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    if connections_tx
        .send(MockNtConnection { cmd_tx, event_rx })
        .is_err()
    {
        return Ok(());
    }

    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => break,
                    Some(Command::Text(text)) => write.send(Message::Text(text.into())).await?,
                    Some(Command::Binary(bytes)) => write.send(Message::Binary(bytes.into())).await?,
                    Some(Command::Close) => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    None | Some(Err(_)) => {
                        let _ = event_tx.send(MockEvent::Closed);
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(&text) {
                            let _ = event_tx.send(MockEvent::Text(values));
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(frames) = BinaryFrame::decode_all(&bytes) {
                            let _ = event_tx.send(MockEvent::Binary(frames));
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        let _ = event_tx.send(MockEvent::Closed);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    Ok(())
}
