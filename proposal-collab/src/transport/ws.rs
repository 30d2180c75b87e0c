//! WebSocket client for [`crate::relay::RelayServer`].
//!
//! One socket carries every channel this client subscribes to. Frames are
//! bincode-encoded [`RelayFrame`]s in binary WebSocket messages.
//!
//! ```text
//!  publish/subscribe ──► outgoing mpsc ──► writer task ──► socket
//!  Inbound (per channel) ◄── reader task ◄──────────────── socket
//! ```
//!
//! When the socket closes, every subscription's [`Inbound`] closes with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{Inbound, PubSubTransport, TransportError, INBOUND_CAPACITY};
use crate::channel::ChannelId;
use crate::protocol::{parse_payload, ChannelMessage, RelayFrame};

/// Default wait for the relay to acknowledge a subscription.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsSource = futures_util::stream::SplitStream<WsStream>;
type Subscriptions = Arc<RwLock<HashMap<String, mpsc::Sender<ChannelMessage>>>>;
type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>>;

struct Link {
    outgoing: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.reader.is_finished() && !self.writer.is_finished()
    }

    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Relay client over a single WebSocket.
pub struct WsTransport {
    url: String,
    ack_timeout: Duration,
    link: Mutex<Option<Link>>,
    subscriptions: Subscriptions,
    pending_acks: PendingAcks,
}

impl WsTransport {
    /// `url` is the relay endpoint, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            link: Mutex::new(None),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.as_ref().is_some_and(Link::is_open)
    }

    /// Close the socket. Every open [`Inbound`] ends.
    pub async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.abort();
        }
        self.subscriptions.write().await.clear();
        self.pending_acks.lock().await.clear();
        log::info!("Closed relay connection to {}", self.url);
    }

    async fn outgoing(&self) -> Result<mpsc::Sender<Vec<u8>>, TransportError> {
        match self.link.lock().await.as_ref() {
            Some(link) if link.is_open() => Ok(link.outgoing.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<(), TransportError> {
        let encoded = frame.encode()?;
        self.outgoing()
            .await?
            .send(encoded)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn forget(&self, channel: &str) {
        self.subscriptions.write().await.remove(channel);
        self.pending_acks.lock().await.remove(channel);
    }

    fn spawn_writer(mut sink: WsSink, mut outgoing_rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(data) = outgoing_rx.recv().await {
                if sink.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        })
    }

    fn spawn_reader(&self, mut stream: WsSource, outgoing: mpsc::Sender<Vec<u8>>) -> JoinHandle<()> {
        let subscriptions = self.subscriptions.clone();
        let pending_acks = self.pending_acks.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let bytes: Vec<u8> = match message {
                    Ok(Message::Binary(data)) => data.into(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Relay connection to {url} failed: {e}");
                        break;
                    }
                };
                let frame = match RelayFrame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Dropping undecodable relay frame: {e}");
                        continue;
                    }
                };

                match frame {
                    RelayFrame::Message {
                        channel,
                        event,
                        payload,
                    } => {
                        let payload = match parse_payload(&payload) {
                            Ok(payload) => payload,
                            Err(e) => {
                                log::warn!("Dropping relayed {event} on {channel}: {e}");
                                continue;
                            }
                        };
                        let sender = subscriptions.read().await.get(&channel).cloned();
                        if let Some(sender) = sender {
                            if sender.send(ChannelMessage::new(event, payload)).await.is_err() {
                                subscriptions.write().await.remove(&channel);
                            }
                        }
                    }
                    RelayFrame::Subscribed { channel } => {
                        if let Some(ack) = pending_acks.lock().await.remove(&channel) {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    RelayFrame::Rejected { channel, reason } => {
                        subscriptions.write().await.remove(&channel);
                        if let Some(ack) = pending_acks.lock().await.remove(&channel) {
                            let _ = ack.send(Err(reason));
                        }
                    }
                    RelayFrame::Dropped { channel, reason } => {
                        log::warn!("Relay dropped subscription to {channel}: {reason}");
                        subscriptions.write().await.remove(&channel);
                    }
                    RelayFrame::Ping => {
                        if let Ok(pong) = RelayFrame::Pong.encode() {
                            let _ = outgoing.send(pong).await;
                        }
                    }
                    RelayFrame::Pong => log::trace!("Pong from {url}"),
                    other => log::debug!("Ignoring unexpected frame from relay: {other:?}"),
                }
            }

            log::info!("Relay connection to {url} closed");
            subscriptions.write().await.clear();
            pending_acks.lock().await.clear();
        })
    }
}

#[async_trait]
impl PubSubTransport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(Link::is_open) {
            return Ok(());
        }
        if let Some(stale) = link.take() {
            stale.abort();
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let (sink, stream) = ws_stream.split();

        let (outgoing, outgoing_rx) = mpsc::channel::<Vec<u8>>(INBOUND_CAPACITY);
        let writer = Self::spawn_writer(sink, outgoing_rx);
        let reader = self.spawn_reader(stream, outgoing.clone());
        *link = Some(Link {
            outgoing,
            reader,
            writer,
        });

        log::info!("Connected to relay at {}", self.url);
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<Inbound, TransportError> {
        let name = channel.to_string();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();

        // Registered before the request so no early delivery is lost.
        self.subscriptions.write().await.insert(name.clone(), tx);
        self.pending_acks.lock().await.insert(name.clone(), ack_tx);

        if let Err(e) = self
            .send_frame(&RelayFrame::Subscribe {
                channel: name.clone(),
            })
            .await
        {
            self.forget(&name).await;
            return Err(e);
        }

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                log::debug!("Subscribed to {name}");
                Ok(rx)
            }
            Ok(Ok(Err(reason))) => {
                self.forget(&name).await;
                Err(TransportError::Rejected {
                    channel: name,
                    reason,
                })
            }
            Ok(Err(_)) => {
                self.forget(&name).await;
                Err(TransportError::Closed)
            }
            Err(_) => {
                self.forget(&name).await;
                Err(TransportError::Timeout("subscription acknowledgement"))
            }
        }
    }

    async fn publish(
        &self,
        channel: &ChannelId,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        let frame = RelayFrame::publish(channel.as_str(), &ChannelMessage::new(event, payload));
        self.send_frame(&frame).await
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), TransportError> {
        self.forget(channel.as_str()).await;
        match self
            .send_frame(&RelayFrame::Unsubscribe {
                channel: channel.to_string(),
            })
            .await
        {
            Ok(()) | Err(TransportError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.abort();
        }
    }
}
