use crate::core::errors::ExchangeError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_native_tls::TlsStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{client_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, warn};

pub const DEFAULT_WS_HOST: &str = "wsaws.okx.com";
pub const DEFAULT_WS_PORT: u16 = 8443;
pub const DEFAULT_WS_PATH: &str = "/ws/v5/public";

/// WebSocket endpoint and session tuning
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Applies to each of connect, TLS handshake and WS handshake
    pub connect_timeout_ms: u64,
    /// Ping period and the threshold for the liveness warning
    pub heartbeat_interval_ms: u64,
    /// Maximum number of subscription intents waiting to be written
    pub pending_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_WS_HOST.to_string(),
            port: DEFAULT_WS_PORT,
            path: DEFAULT_WS_PATH.to_string(),
            connect_timeout_ms: 30_000,
            heartbeat_interval_ms: 20_000,
            pending_capacity: 64,
        }
    }
}

impl WsConfig {
    /// Defaults with `{PREFIX}_WS_HOST`, `{PREFIX}_WS_PORT` and `{PREFIX}_WS_PATH` overrides
    pub fn from_env(exchange_prefix: &str) -> Self {
        let prefix = exchange_prefix.to_uppercase();
        let mut config = Self::default();

        if let Ok(host) = env::var(format!("{}_WS_HOST", prefix)) {
            config.host = host;
        }
        let port_var = format!("{}_WS_PORT", prefix);
        if let Ok(port) = env::var(&port_var) {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(e) => warn!(
                    "Ignoring {}={:?} ({}), using port {}",
                    port_var, port, e, config.port
                ),
            }
        }
        if let Ok(path) = env::var(format!("{}_WS_PATH", prefix)) {
            config.path = path;
        }

        config
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn url(&self) -> String {
        format!("wss://{}:{}{}", self.host, self.port, self.path)
    }
}

/// WebSocket transport - one step per connection stage, then raw frames
///
/// Ping, pong and close frames are passed through to the caller; the transport
/// does not answer or swallow them.
#[async_trait]
pub trait WsTransport: Send {
    /// Resolve the endpoint addresses
    async fn resolve(&mut self, host: &str, port: u16) -> Result<(), ExchangeError>;

    /// Open the TCP connection to the first reachable resolved address
    async fn connect(&mut self) -> Result<(), ExchangeError>;

    /// Perform the TLS handshake (with SNI for the resolved host)
    async fn tls_handshake(&mut self) -> Result<(), ExchangeError>;

    /// Perform the WebSocket upgrade on `path`
    async fn ws_handshake(&mut self, path: &str) -> Result<(), ExchangeError>;

    /// Send a raw message
    async fn send_raw(&mut self, msg: Message) -> Result<(), ExchangeError>;

    /// Receive the next raw message; `None` once the stream has ended
    async fn next_raw(&mut self) -> Option<Result<Message, ExchangeError>>;

    /// Start the close handshake and release the connection
    async fn close(&mut self) -> Result<(), ExchangeError>;

    /// Check if the connection is open
    fn is_connected(&self) -> bool;
}

/// Tungstenite-based transport over native-tls
pub struct TungsteniteWs {
    exchange_name: String,
    connect_timeout: Duration,
    host: String,
    port: u16,
    addrs: Vec<SocketAddr>,
    tcp: Option<TcpStream>,
    tls: Option<TlsStream<TcpStream>>,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    connected: bool,
}

impl TungsteniteWs {
    /// # Arguments
    /// * `exchange_name` - Name of the exchange for logging/tracing
    /// * `connect_timeout` - Upper bound for each connection stage
    pub fn new(exchange_name: String, connect_timeout: Duration) -> Self {
        Self {
            exchange_name,
            connect_timeout,
            host: String::new(),
            port: 0,
            addrs: Vec::new(),
            tcp: None,
            tls: None,
            stream: None,
            connected: false,
        }
    }

    fn stream_mut(
        &mut self,
    ) -> Result<&mut WebSocketStream<MaybeTlsStream<TcpStream>>, ExchangeError> {
        if !self.connected {
            return Err(ExchangeError::NetworkError(
                "WebSocket not connected".to_string(),
            ));
        }
        self.stream.as_mut().ok_or_else(|| {
            ExchangeError::NetworkError("WebSocket stream not available".to_string())
        })
    }
}

#[async_trait]
impl WsTransport for TungsteniteWs {
    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    async fn resolve(&mut self, host: &str, port: u16) -> Result<(), ExchangeError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ExchangeError::NetworkError(format!("Failed to resolve {}: {}", host, e)))?
            .collect();

        if addrs.is_empty() {
            return Err(ExchangeError::NetworkError(format!(
                "No addresses found for {}",
                host
            )));
        }

        self.host = host.to_string();
        self.port = port;
        self.addrs = addrs;
        Ok(())
    }

    #[instrument(skip(self), fields(exchange = %self.exchange_name, host = %self.host))]
    async fn connect(&mut self) -> Result<(), ExchangeError> {
        let mut last_error = None;

        for addr in &self.addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(tcp)) => {
                    if let Err(e) = tcp.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    self.tcp = Some(tcp);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    last_error = Some(ExchangeError::NetworkError(format!(
                        "Failed to connect to {}: {}",
                        addr, e
                    )));
                }
                Err(_) => {
                    last_error = Some(ExchangeError::ConnectionTimeout(format!(
                        "TCP connect to {} timed out",
                        addr
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ExchangeError::NetworkError("No resolved addresses to connect to".to_string())
        }))
    }

    #[instrument(skip(self), fields(exchange = %self.exchange_name, host = %self.host))]
    async fn tls_handshake(&mut self) -> Result<(), ExchangeError> {
        let tcp = self.tcp.take().ok_or_else(|| {
            ExchangeError::NetworkError("TLS handshake without a TCP connection".to_string())
        })?;

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| ExchangeError::NetworkError(format!("Failed to build TLS connector: {}", e)))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tls = tokio::time::timeout(self.connect_timeout, connector.connect(&self.host, tcp))
            .await
            .map_err(|_| ExchangeError::ConnectionTimeout("TLS handshake timeout".to_string()))?
            .map_err(|e| ExchangeError::NetworkError(format!("TLS handshake failed: {}", e)))?;

        self.tls = Some(tls);
        Ok(())
    }

    #[instrument(skip(self), fields(exchange = %self.exchange_name, host = %self.host))]
    async fn ws_handshake(&mut self, path: &str) -> Result<(), ExchangeError> {
        let tls = self.tls.take().ok_or_else(|| {
            ExchangeError::NetworkError("WebSocket handshake without a TLS stream".to_string())
        })?;

        let url = format!("wss://{}:{}{}", self.host, self.port, path);
        let mut request = url.as_str().into_client_request().map_err(|e| {
            ExchangeError::InvalidParameters(format!("Invalid WebSocket URL {}: {}", url, e))
        })?;
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static("okx-stream"));

        let (stream, _) = tokio::time::timeout(
            self.connect_timeout,
            client_async(request, MaybeTlsStream::NativeTls(tls)),
        )
        .await
        .map_err(|_| ExchangeError::ConnectionTimeout("WebSocket handshake timeout".to_string()))?
        .map_err(|e| ExchangeError::NetworkError(format!("WebSocket handshake failed: {}", e)))?;

        self.stream = Some(stream);
        self.connected = true;
        Ok(())
    }

    #[instrument(skip(self, msg), fields(exchange = %self.exchange_name))]
    async fn send_raw(&mut self, msg: Message) -> Result<(), ExchangeError> {
        let result = self.stream_mut()?.send(msg).await;

        result.map_err(|e| {
            self.connected = false;
            ExchangeError::NetworkError(format!("Failed to send WebSocket message: {}", e))
        })
    }

    async fn next_raw(&mut self) -> Option<Result<Message, ExchangeError>> {
        let stream = match self.stream_mut() {
            Ok(stream) => stream,
            Err(e) => return Some(Err(e)),
        };

        let next = stream.next().await;
        match next {
            Some(Ok(message)) => {
                if matches!(message, Message::Close(_)) {
                    self.connected = false;
                }
                Some(Ok(message))
            }
            Some(Err(e)) => {
                self.connected = false;
                Some(Err(ExchangeError::NetworkError(format!(
                    "WebSocket error: {}",
                    e
                ))))
            }
            None => {
                self.connected = false;
                None
            }
        }
    }

    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    async fn close(&mut self) -> Result<(), ExchangeError> {
        let result = match self.stream.as_mut() {
            Some(stream) if self.connected => stream
                .close(None)
                .await
                .map_err(|e| ExchangeError::NetworkError(format!("WebSocket close failed: {}", e))),
            _ => Ok(()),
        };

        self.connected = false;
        self.stream = None;
        self.tls = None;
        self.tcp = None;
        result
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// In-memory transport fed through a [`ChannelWsHandle`].
///
/// Every connection stage succeeds unless a failure was configured; inbound
/// frames are whatever the handle pushes, and every sent frame is recorded.
/// Used to replay captured streams and to drive sessions in tests.
pub struct ChannelWs {
    inbound: mpsc::UnboundedReceiver<Message>,
    sent: Arc<Mutex<Vec<Message>>>,
    closed: Arc<AtomicBool>,
    connect_error: Option<String>,
    connected: bool,
}

/// Remote end of a [`ChannelWs`]
#[derive(Clone)]
pub struct ChannelWsHandle {
    inbound: mpsc::UnboundedSender<Message>,
    sent: Arc<Mutex<Vec<Message>>>,
    closed: Arc<AtomicBool>,
}

impl ChannelWs {
    pub fn pair() -> (Self, ChannelWsHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Self {
            inbound: rx,
            sent: sent.clone(),
            closed: closed.clone(),
            connect_error: None,
            connected: false,
        };
        let handle = ChannelWsHandle {
            inbound: tx,
            sent,
            closed,
        };

        (transport, handle)
    }

    /// Make the TCP connect stage fail with `message`
    pub fn with_connect_error(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }
}

impl ChannelWsHandle {
    /// Queue an inbound frame; false once the transport is gone
    pub fn push(&self, msg: Message) -> bool {
        self.inbound.send(msg).is_ok()
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(Message::Text(text.into()))
    }

    /// Frames written by the session so far
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Text frames written by the session so far
    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                Message::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// True once the session has closed the transport
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WsTransport for ChannelWs {
    async fn resolve(&mut self, _host: &str, _port: u16) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), ExchangeError> {
        match &self.connect_error {
            Some(message) => Err(ExchangeError::NetworkError(message.clone())),
            None => Ok(()),
        }
    }

    async fn tls_handshake(&mut self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn ws_handshake(&mut self, _path: &str) -> Result<(), ExchangeError> {
        self.connected = true;
        Ok(())
    }

    async fn send_raw(&mut self, msg: Message) -> Result<(), ExchangeError> {
        if !self.connected {
            return Err(ExchangeError::NetworkError(
                "WebSocket not connected".to_string(),
            ));
        }
        self.sent.lock().push(msg);
        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<Message, ExchangeError>> {
        let message = self.inbound.recv().await;
        if message.is_none() {
            self.connected = false;
        }
        message.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ExchangeError> {
        self.connected = false;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_targets_public_endpoint() {
        let config = WsConfig::default();
        assert_eq!(config.url(), "wss://wsaws.okx.com:8443/ws/v5/public");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(20));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides_and_bad_port() {
        env::set_var("WSCFGTEST_WS_HOST", "ws.okx.com");
        env::set_var("WSCFGTEST_WS_PORT", "443");
        let config = WsConfig::from_env("wscfgtest");
        assert_eq!(config.host, "ws.okx.com");
        assert_eq!(config.port, 443);

        env::set_var("WSCFGTEST_WS_PORT", "84x3");
        let config = WsConfig::from_env("wscfgtest");
        assert_eq!(config.port, DEFAULT_WS_PORT);

        env::remove_var("WSCFGTEST_WS_HOST");
        env::remove_var("WSCFGTEST_WS_PORT");
    }

    #[test]
    fn test_config_builders() {
        let config = WsConfig::default()
            .with_endpoint("ws.okx.com", 443)
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_pending_capacity(4);

        assert_eq!(config.url(), "wss://ws.okx.com:443/ws/v5/public");
        assert_eq!(config.heartbeat_interval_ms, 5_000);
        assert_eq!(config.pending_capacity, 4);
    }

    #[tokio::test]
    async fn test_channel_ws_records_sent_frames() {
        let (mut transport, handle) = ChannelWs::pair();

        assert!(transport.send_raw(Message::Text("early".into())).await.is_err());

        transport.resolve("localhost", 1).await.unwrap();
        transport.connect().await.unwrap();
        transport.tls_handshake().await.unwrap();
        transport.ws_handshake("/").await.unwrap();
        assert!(transport.is_connected());

        transport
            .send_raw(Message::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(handle.sent_text(), vec!["hello".to_string()]);

        handle.push_text("world");
        let received = transport.next_raw().await.unwrap().unwrap();
        assert_eq!(received, Message::Text("world".into()));

        transport.close().await.unwrap();
        assert!(handle.is_closed());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_channel_ws_ends_when_handle_dropped() {
        let (mut transport, handle) = ChannelWs::pair();
        transport.ws_handshake("/").await.unwrap();
        drop(handle);

        assert!(transport.next_raw().await.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_channel_ws_connect_error() {
        let (transport, _handle) = ChannelWs::pair();
        let mut transport = transport.with_connect_error("refused");

        let err = transport.connect().await.unwrap_err();
        assert!(err.to_string().contains("refused"));
    }
}
