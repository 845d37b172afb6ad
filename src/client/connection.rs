//! Lifecycle of the duplex channel to the realtime service.
//!
//! [`ConnectionManager`] owns at most one live [`DuplexLink`] at a time. A
//! link is only installed after the session configuration has been written
//! to it, so every consumer that observes an open link can rely on the
//! service already knowing the session. Any detected failure removes the
//! link immediately; the next `connect` (or a `receive` while reconnection is
//! enabled) replaces it wholesale.

use crate::config::ReconnectConfig;
use crate::error::{BridgeError, LinkFailure};
use crate::types::{ClientEvent, SessionConfig};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as TokioMutex, RwLock, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A frame received from a link.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Pong,
    Close,
}

/// An established duplex channel.
#[async_trait]
pub trait DuplexLink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), BridgeError>;

    /// Next inbound frame; `None` once the underlying stream has ended.
    async fn recv(&self) -> Option<Result<Inbound, BridgeError>>;

    async fn ping(&self) -> Result<(), BridgeError>;

    async fn close(&self);
}

/// Opens new links to the service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn DuplexLink>, BridgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

/// Failure reason reported when the service closes the channel cleanly.
pub const CLOSED_BY_PEER: &str = "closed by peer";

/// Result of a successful `receive`.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Frame(String),
    /// Nothing arrived within the timeout. The link is still considered alive.
    Timeout,
}

/// Exponential backoff `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    session: SessionConfig,
    config: ReconnectConfig,
    backoff: Backoff,
    link: RwLock<Option<Arc<dyn DuplexLink>>>,
    connect_lock: TokioMutex<()>,
    attempt: AtomicU32,
    reconnect_enabled: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    pong_seq: watch::Sender<u64>,
    stop: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        session: SessionConfig,
        config: ReconnectConfig,
        stop: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (pong_seq, _) = watch::channel(0u64);
        Self {
            connector,
            session,
            backoff: Backoff::from_config(&config),
            reconnect_enabled: AtomicBool::new(config.enabled),
            config,
            link: RwLock::new(None),
            connect_lock: TokioMutex::new(()),
            attempt: AtomicU32::new(0),
            state_tx,
            pong_seq,
            stop,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled.load(Ordering::SeqCst)
    }

    pub fn set_reconnect_enabled(&self, enabled: bool) {
        self.reconnect_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub async fn is_open(&self) -> bool {
        self.link.read().await.is_some()
    }

    async fn current_link(&self) -> Option<Arc<dyn DuplexLink>> {
        self.link.read().await.clone()
    }

    /// Connects, retrying with backoff until a link is open or the manager is
    /// stopped. Returns immediately if a link is already installed.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let _guard = self.connect_lock.lock().await;
        if self.current_link().await.is_some() {
            return Ok(());
        }

        loop {
            if self.stop.is_cancelled() {
                return Err(BridgeError::Stopped);
            }
            self.state_tx.send_replace(ConnectionState::Connecting);

            match self.open_with_session().await {
                Ok(link) => {
                    *self.link.write().await = Some(link);
                    self.attempt.store(0, Ordering::SeqCst);
                    self.state_tx.send_replace(ConnectionState::Open);
                    info!("[Connection] Connected; session configuration sent.");
                    return Ok(());
                }
                Err(e) => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "[Connection] Connect failed: {}. Retrying in {:?} (attempt {}).",
                        e, delay, attempt
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => return Err(BridgeError::Stopped),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn open_with_session(&self) -> Result<Arc<dyn DuplexLink>, BridgeError> {
        let link = self.connector.open().await?;
        let payload = ClientEvent::session_update(&self.session).to_json()?;
        if let Err(e) = link.send_text(payload).await {
            link.close().await;
            return Err(e);
        }
        Ok(link)
    }

    fn failure(&self, reason: String) -> LinkFailure {
        if self.reconnect_enabled() {
            LinkFailure::Retryable(reason)
        } else {
            LinkFailure::Fatal(reason)
        }
    }

    /// Removes `failed` if it is still the installed link.
    pub(crate) async fn invalidate(&self, failed: &Arc<dyn DuplexLink>) {
        let removed = {
            let mut guard = self.link.write().await;
            match guard.as_ref() {
                Some(current) if Arc::ptr_eq(current, failed) => guard.take(),
                _ => None,
            }
        };
        if let Some(link) = removed {
            link.close().await;
            if self.state() != ConnectionState::Closed {
                self.state_tx.send_replace(ConnectionState::Disconnected);
            }
            warn!("[Connection] Link invalidated.");
        }
    }

    pub async fn send(&self, event: &ClientEvent) -> Result<(), LinkFailure> {
        let payload = event
            .to_json()
            .map_err(|e| LinkFailure::Fatal(format!("unencodable event: {}", e)))?;
        let Some(link) = self.current_link().await else {
            return Err(self.failure(BridgeError::NotReady.to_string()));
        };
        match link.send_text(payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("[Connection] Send failed: {}", e);
                self.invalidate(&link).await;
                Err(self.failure(e.to_string()))
            }
        }
    }

    /// Waits up to `timeout` for the next text frame. Reconnects first when no
    /// link is installed and reconnection is enabled.
    pub async fn receive(&self, timeout: Duration) -> Result<Received, LinkFailure> {
        let link = match self.current_link().await {
            Some(link) => link,
            None if self.reconnect_enabled() => {
                match self.connect().await {
                    Ok(()) => {}
                    Err(BridgeError::Stopped) => {
                        return Err(LinkFailure::Fatal("stopped".to_string()));
                    }
                    Err(e) => return Err(self.failure(e.to_string())),
                }
                self.current_link()
                    .await
                    .ok_or_else(|| self.failure("link lost after connect".to_string()))?
            }
            None => return Err(LinkFailure::Fatal(BridgeError::NotReady.to_string())),
        };

        let deadline = Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, link.recv()).await;
            match next {
                Err(_) => return Ok(Received::Timeout),
                Ok(Some(Ok(Inbound::Text(text)))) => return Ok(Received::Frame(text)),
                Ok(Some(Ok(Inbound::Pong))) => {
                    trace!("[Connection] Pong received.");
                    self.pong_seq.send_modify(|seq| *seq = seq.wrapping_add(1));
                }
                Ok(Some(Ok(Inbound::Close))) | Ok(None) => {
                    info!("[Connection] Link closed by peer.");
                    self.invalidate(&link).await;
                    return Err(self.failure(CLOSED_BY_PEER.to_string()));
                }
                Ok(Some(Err(e))) => {
                    error!("[Connection] Receive error: {}", e);
                    self.invalidate(&link).await;
                    return Err(self.failure(e.to_string()));
                }
            }
        }
    }

    /// Sends a ping and waits for the pong to be surfaced by `receive`. A
    /// missed pong drops the pinged link only; a replacement installed in the
    /// meantime is left alone.
    pub async fn ping(&self, timeout: Duration) -> Result<(), LinkFailure> {
        let Some(link) = self.current_link().await else {
            return Err(self.failure(BridgeError::NotReady.to_string()));
        };
        let mut pongs = self.pong_seq.subscribe();
        pongs.borrow_and_update();
        if let Err(e) = link.ping().await {
            self.invalidate(&link).await;
            return Err(self.failure(e.to_string()));
        }
        match tokio::time::timeout(timeout, pongs.changed()).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.invalidate(&link).await;
                Err(self.failure(format!("no pong within {:?}", timeout)))
            }
        }
    }

    /// Closes the installed link, if any. Safe to call repeatedly.
    pub async fn close(&self) {
        let link = self.link.write().await.take();
        if let Some(link) = link {
            link.close().await;
            debug!("[Connection] Link closed.");
        }
        self.state_tx.send_replace(ConnectionState::Closed);
    }

    /// Disables reconnection and closes.
    pub async fn shutdown(&self) {
        self.set_reconnect_enabled(false);
        self.close().await;
        info!("[Connection] Shut down.");
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the OpenAI realtime endpoint over a TLS websocket.
pub struct WsConnector {
    endpoint: String,
    api_key: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<Arc<dyn DuplexLink>, BridgeError> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut request = self.endpoint.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| BridgeError::Config(format!("invalid api key header: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        info!("[Connection] Connecting to {}", self.endpoint);
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BridgeError::ConnectionError(e.to_string()))?;
        let (sink, stream) = ws.split();
        Ok(Arc::new(WsLink {
            sink: TokioMutex::new(sink),
            stream: TokioMutex::new(stream),
        }))
    }
}

struct WsLink {
    sink: TokioMutex<SplitSink<WsStream, Message>>,
    stream: TokioMutex<SplitStream<WsStream>>,
}

#[async_trait]
impl DuplexLink for WsLink {
    async fn send_text(&self, text: String) -> Result<(), BridgeError> {
        self.sink.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Inbound, BridgeError>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.as_str().to_owned()))),
                Ok(Message::Pong(_)) => return Some(Ok(Inbound::Pong)),
                Ok(Message::Close(frame)) => {
                    debug!("[Connection] Close frame: {:?}", frame);
                    return Some(Ok(Inbound::Close));
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.sink.lock().await.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Binary(data)) => {
                    trace!("[Connection] Ignoring {} byte binary frame.", data.len());
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        self.sink
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("[Connection] Error while closing websocket: {}", e);
        }
    }
}
