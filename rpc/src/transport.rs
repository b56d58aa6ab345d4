use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to send: {0}")]
    Send(String),
    #[error("the connection is closed")]
    Closed,
}

/// Dials one connection. A reconnect always goes back through the transport, so
/// every attempt gets a fresh [`TransportLink`] with fresh resources.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One live, ordered, bidirectional text-message connection.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// The next inbound text message. `None` means the connection is closed.
    /// Messages are yielded strictly in arrival order.
    async fn next_message(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

/// Production transport: a websocket speaking text frames.
#[derive(Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        WsTransport
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportLink>, TransportError> {
        let (stream, _response) = connect_async(url).await.map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text)).await.map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                // Control frames are handled by tungstenite; skip them here.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => continue,
                },
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(TransportError::Send(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(any(test, feature = "memory_transport"))]
pub mod memory {
    //! An in-memory duplex transport for tests: each `connect` consumes one
    //! scripted link from a queue, so reconnect behaviour can be exercised
    //! without sockets.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// One end of an in-memory link.
    pub struct MemoryLink {
        pub outbound: mpsc::UnboundedSender<String>,
        pub inbound: mpsc::UnboundedReceiver<String>,
        closed: bool,
    }

    /// The peer's handle: read what the client sent, feed it replies, or hang up.
    pub struct MemoryPeer {
        pub from_client: mpsc::UnboundedReceiver<String>,
        pub to_client: mpsc::UnboundedSender<String>,
    }

    /// Create a connected link/peer pair.
    pub fn link_pair() -> (MemoryLink, MemoryPeer) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        (
            MemoryLink { outbound: client_tx, inbound: server_rx, closed: false },
            MemoryPeer { from_client: client_rx, to_client: server_tx },
        )
    }

    #[async_trait]
    impl TransportLink for MemoryLink {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            self.outbound.send(text).map_err(|_| TransportError::Closed)
        }

        async fn next_message(&mut self) -> Option<Result<String, TransportError>> {
            if self.closed {
                return None;
            }
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    /// A transport whose `connect` hands out pre-built links in order and fails
    /// once the queue runs dry.
    pub struct MemoryTransport {
        links: Mutex<VecDeque<MemoryLink>>,
        pub dial_count: Mutex<u32>,
    }

    impl MemoryTransport {
        pub fn new(links: Vec<MemoryLink>) -> Self {
            MemoryTransport { links: Mutex::new(links.into()), dial_count: Mutex::new(0) }
        }

        pub fn dials(&self) -> u32 {
            *self.dial_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self, _url: &str) -> Result<Box<dyn TransportLink>, TransportError> {
            *self.dial_count.lock().unwrap() += 1;
            match self.links.lock().unwrap().pop_front() {
                Some(link) => Ok(Box::new(link)),
                None => Err(TransportError::Connect("no link available".into())),
            }
        }
    }
}
