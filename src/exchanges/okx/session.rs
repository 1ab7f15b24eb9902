use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use crate::core::kernel::ws::{WsConfig, WsTransport};
use crate::core::logging::Logger;
use crate::exchanges::okx::codec::{OkxCodec, OkxMessage};
use crate::exchanges::okx::types::{ControlResponse, DataEvent, EventKind, Subscription};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::instrument;

/// Receives every decoded data event, on the network thread
pub type DataEventCallback = Arc<dyn Fn(&DataEvent) + Send + Sync>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Resolving,
    Connecting,
    TlsHandshaking,
    WsHandshaking,
    /// Writing a subscribe request
    Subscribing,
    /// Waiting for the next inbound message
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Staged,
    AlreadyConfirmed,
    AlreadyPending,
    QueueFull,
    /// The session retired and takes no more intents
    Closed,
}

/// Confirmed subscriptions plus intents waiting to be written
#[derive(Debug)]
pub struct SubscriptionBook {
    confirmed: Vec<String>,
    pending: VecDeque<Subscription>,
    capacity: usize,
    accepting: bool,
}

impl SubscriptionBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            confirmed: Vec::new(),
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            accepting: true,
        }
    }

    pub fn stage(&mut self, subscription: Subscription) -> StageOutcome {
        if !self.accepting {
            return StageOutcome::Closed;
        }
        if self.is_confirmed(&subscription) {
            return StageOutcome::AlreadyConfirmed;
        }
        if self.pending.contains(&subscription) {
            return StageOutcome::AlreadyPending;
        }
        if self.pending.len() >= self.capacity {
            return StageOutcome::QueueFull;
        }
        self.pending.push_back(subscription);
        StageOutcome::Staged
    }

    /// Drain every pending intent, oldest first
    pub fn take_pending(&mut self) -> Vec<Subscription> {
        self.pending.drain(..).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn confirm(&mut self, subscription: &Subscription) {
        let key = subscription.canonical();
        if !self.confirmed.contains(&key) {
            self.confirmed.push(key);
        }
    }

    pub fn remove(&mut self, subscription: &Subscription) {
        let key = subscription.canonical();
        self.confirmed.retain(|k| *k != key);
    }

    pub fn is_confirmed(&self, subscription: &Subscription) -> bool {
        let key = subscription.canonical();
        self.confirmed.iter().any(|k| *k == key)
    }

    pub fn confirmed_len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Stop accepting intents when nothing is confirmed or pending.
    /// Returns true if the book retired.
    pub fn retire_if_idle(&mut self) -> bool {
        if self.accepting && self.confirmed.is_empty() && self.pending.is_empty() {
            self.accepting = false;
        }
        !self.accepting
    }

    pub fn retire(&mut self) {
        self.accepting = false;
        self.pending.clear();
    }
}

/// Ping/pong bookkeeping
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_ping: None,
            last_pong: None,
        }
    }

    pub fn record_ping(&mut self, at: Instant) {
        self.last_ping = Some(at);
    }

    pub fn record_pong(&mut self, at: Instant) {
        self.last_pong = Some(at);
    }

    /// A sent ping has gone unanswered for longer than one interval
    pub fn is_expired(&self) -> bool {
        match (self.last_ping, self.last_pong) {
            (Some(ping), Some(pong)) => ping.saturating_duration_since(pong) > self.interval,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

enum Step {
    Close,
    Heartbeat,
    Flush,
    Frame(Option<Result<Message, ExchangeError>>),
}

enum Flow {
    Continue,
    Stop,
}

struct SessionShared {
    id: u64,
    config: WsConfig,
    codec: OkxCodec,
    logger: Logger,
    state: Mutex<SessionState>,
    book: Mutex<SubscriptionBook>,
    pending_notify: Notify,
    close_notify: Notify,
    closing: AtomicBool,
}

/// Handle to one WebSocket connection and its subscriptions.
///
/// Clones share the same session. The task returned by [`Session::run`] owns
/// the transport; handles only stage intents, query membership and request a
/// close, so they stay valid (and report `is_alive() == false`) after the
/// connection is gone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(config: WsConfig, logger: Logger) -> Self {
        let capacity = config.pending_capacity;
        Self {
            shared: Arc::new(SessionShared {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                config,
                codec: OkxCodec,
                logger,
                state: Mutex::new(SessionState::Created),
                book: Mutex::new(SubscriptionBook::new(capacity)),
                pending_notify: Notify::new(),
                close_notify: Notify::new(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// True while the session accepts intents and has not started closing
    pub fn is_alive(&self) -> bool {
        !self.shared.closing.load(Ordering::SeqCst)
            && self.state() != SessionState::Closed
            && self.shared.book.lock().is_accepting()
    }

    /// Build the session task.
    ///
    /// The initial subscriptions are staged immediately and written as one
    /// request right after the WebSocket handshake.
    pub fn run(
        &self,
        transport: Box<dyn WsTransport>,
        host: &str,
        port: u16,
        initial_subscriptions: Vec<Subscription>,
        on_data: DataEventCallback,
    ) -> Result<BoxFuture<'static, ()>, ExchangeError> {
        if initial_subscriptions.is_empty() {
            return Err(ExchangeError::InvalidParameters(
                "a session needs at least one initial subscription".to_string(),
            ));
        }

        {
            let mut book = self.shared.book.lock();
            for subscription in initial_subscriptions {
                if book.stage(subscription.clone()) == StageOutcome::QueueFull {
                    self.shared.logger.warn(&format!(
                        "Pending queue full, dropping subscription {}",
                        subscription
                    ));
                }
            }
        }

        let shared = self.shared.clone();
        let host = host.to_string();
        Ok(Box::pin(async move {
            shared.drive(transport, host, port, on_data).await;
        }))
    }

    /// Stage a subscription intent.
    ///
    /// Returns false only when the session has retired; the intent is then
    /// not recorded.
    pub fn subscribe(&self, subscription: Subscription) -> bool {
        let outcome = self.shared.book.lock().stage(subscription.clone());

        match outcome {
            StageOutcome::Staged => {
                self.shared.pending_notify.notify_one();
                true
            }
            StageOutcome::AlreadyConfirmed | StageOutcome::AlreadyPending => true,
            StageOutcome::QueueFull => {
                self.shared.logger.warn(&format!(
                    "Pending queue full, dropping subscription {}",
                    subscription
                ));
                true
            }
            StageOutcome::Closed => false,
        }
    }

    pub fn is_subscribed(&self, subscription: &Subscription) -> bool {
        self.shared.book.lock().is_confirmed(subscription)
    }

    /// Request a graceful close. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            self.shared.close_notify.notify_one();
        }
    }
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn drive(
        &self,
        mut transport: Box<dyn WsTransport>,
        host: String,
        port: u16,
        on_data: DataEventCallback,
    ) {
        self.logger
            .info(&format!("Session {} connecting to {}:{}", self.id, host, port));

        match self.establish(transport.as_mut(), &host, port).await {
            Ok(true) => self.stream(transport.as_mut(), &on_data).await,
            Ok(false) => {}
            Err(e) => self.logger.error(&format!("Session {}: {}", self.id, e)),
        }

        self.finish(transport.as_mut()).await;
    }

    /// Walk the connection stages. Ok(false) means a close was requested on the way.
    #[instrument(skip(self, transport), fields(session = self.id))]
    async fn establish(
        &self,
        transport: &mut dyn WsTransport,
        host: &str,
        port: u16,
    ) -> Result<bool, ExchangeError> {
        if self.is_closing() {
            return Ok(false);
        }
        self.set_state(SessionState::Resolving);
        transport
            .resolve(host, port)
            .await
            .map_err(|e| stage_error("resolve", e))?;

        if self.is_closing() {
            return Ok(false);
        }
        self.set_state(SessionState::Connecting);
        transport
            .connect()
            .await
            .map_err(|e| stage_error("connect", e))?;

        if self.is_closing() {
            return Ok(false);
        }
        self.set_state(SessionState::TlsHandshaking);
        transport
            .tls_handshake()
            .await
            .map_err(|e| stage_error("TLS handshake", e))?;

        if self.is_closing() {
            return Ok(false);
        }
        self.set_state(SessionState::WsHandshaking);
        transport
            .ws_handshake(&self.config.path)
            .await
            .map_err(|e| stage_error("WebSocket handshake", e))?;

        Ok(!self.is_closing())
    }

    async fn stream(&self, transport: &mut dyn WsTransport, on_data: &DataEventCallback) {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = Heartbeat::new(period);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Err(e) = self.flush_pending(transport).await {
            self.logger.error(&format!("Session {}: {}", self.id, e));
            return;
        }

        loop {
            let step = tokio::select! {
                _ = self.close_notify.notified() => Step::Close,
                _ = ticker.tick() => Step::Heartbeat,
                _ = self.pending_notify.notified() => Step::Flush,
                frame = transport.next_raw() => Step::Frame(frame),
            };

            let flow = match step {
                Step::Close => Flow::Stop,
                Step::Heartbeat => self.on_heartbeat(transport, &mut heartbeat).await,
                Step::Flush => self.flush_if_pending(transport).await,
                Step::Frame(None) => {
                    self.logger
                        .info(&format!("Session {}: stream ended by remote", self.id));
                    Flow::Stop
                }
                Step::Frame(Some(Err(e))) => {
                    self.logger
                        .error(&format!("Session {}: read failed: {}", self.id, e));
                    Flow::Stop
                }
                Step::Frame(Some(Ok(message))) => {
                    self.on_message(transport, message, &mut heartbeat, on_data)
                        .await
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }
    }

    async fn on_heartbeat(
        &self,
        transport: &mut dyn WsTransport,
        heartbeat: &mut Heartbeat,
    ) -> Flow {
        if heartbeat.is_expired() {
            self.logger.warn(&format!(
                "Session {}: ping expired, no pong within {:?}",
                self.id, heartbeat.interval
            ));
        }

        if !transport.is_connected() {
            return Flow::Continue;
        }

        match transport.send_raw(Message::Ping(Vec::new())).await {
            Ok(()) => {
                heartbeat.record_ping(Instant::now());
                Flow::Continue
            }
            Err(e) => {
                self.logger
                    .error(&format!("Session {}: ping failed: {}", self.id, e));
                Flow::Stop
            }
        }
    }

    async fn on_message(
        &self,
        transport: &mut dyn WsTransport,
        message: Message,
        heartbeat: &mut Heartbeat,
        on_data: &DataEventCallback,
    ) -> Flow {
        match message {
            Message::Ping(payload) => {
                return match transport.send_raw(Message::Pong(payload)).await {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        self.logger
                            .error(&format!("Session {}: pong failed: {}", self.id, e));
                        Flow::Stop
                    }
                };
            }
            Message::Pong(_) => {
                heartbeat.record_pong(Instant::now());
                return Flow::Continue;
            }
            Message::Close(frame) => {
                self.logger.info(&format!(
                    "Session {}: server closed the connection: {:?}",
                    self.id, frame
                ));
                return Flow::Stop;
            }
            Message::Frame(_) => return Flow::Continue,
            Message::Text(_) | Message::Binary(_) => {}
        }

        if let Flow::Stop = self.on_frame(message, on_data) {
            return Flow::Stop;
        }

        self.flush_or_stop(transport).await
    }

    fn on_frame(&self, message: Message, on_data: &DataEventCallback) -> Flow {
        match self.codec.decode_message(message) {
            Ok(None) => {}
            Ok(Some(OkxMessage::Control(response))) => self.apply_control(response),
            Ok(Some(OkxMessage::Data(event))) => {
                if catch_unwind(AssertUnwindSafe(|| on_data(&event))).is_err() {
                    self.logger.error(&format!(
                        "Session {}: data callback panicked on {}:{}",
                        self.id, event.channel, event.inst_id
                    ));
                }
            }
            // Unreadable input means the stream itself is broken
            Err(ExchangeError::DeserializationError(e)) => {
                self.logger.error(&format!("Session {}: {}", self.id, e));
                return Flow::Stop;
            }
            Err(e) => self.logger.warn(&format!(
                "Session {}: dropping message: {}",
                self.id, e
            )),
        }

        Flow::Continue
    }

    fn apply_control(&self, response: ControlResponse) {
        match (response.event, response.subscription) {
            (EventKind::Subscribe, Some(subscription)) => {
                self.book.lock().confirm(&subscription);
                self.logger.info(&format!("subscribed: {}", subscription));
            }
            (EventKind::Unsubscribe, Some(subscription)) => {
                self.book.lock().remove(&subscription);
                self.logger.info(&format!("unsubscribed: {}", subscription));
            }
            (EventKind::Error, _) => {
                self.logger.error(&format!(
                    "Subscription error {}: {}",
                    response.code.as_deref().unwrap_or("?"),
                    response.message.as_deref().unwrap_or("")
                ));
            }
            (event, None) => {
                self.logger
                    .warn(&format!("Ack {:?} without a subscription", event));
            }
        }
    }

    /// Wake-up path: a stale notification finds nothing to write
    async fn flush_if_pending(&self, transport: &mut dyn WsTransport) -> Flow {
        let has_pending = self.book.lock().has_pending();
        if !has_pending {
            return Flow::Continue;
        }

        match self.flush_pending(transport).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                self.logger.error(&format!("Session {}: {}", self.id, e));
                Flow::Stop
            }
        }
    }

    /// Write pending intents if any; otherwise retire when nothing is left
    async fn flush_or_stop(&self, transport: &mut dyn WsTransport) -> Flow {
        let has_pending = self.book.lock().has_pending();
        if has_pending {
            return self.flush_if_pending(transport).await;
        }

        if self.book.lock().retire_if_idle() {
            self.logger
                .warn(&format!("Session {}: no subscriptions, closing", self.id));
            return Flow::Stop;
        }

        Flow::Continue
    }

    async fn flush_pending(&self, transport: &mut dyn WsTransport) -> Result<(), ExchangeError> {
        let pending = self.book.lock().take_pending();

        if !pending.is_empty() {
            self.set_state(SessionState::Subscribing);
            let frame = self.codec.encode_subscription(&pending)?;
            transport
                .send_raw(frame)
                .await
                .map_err(|e| stage_error("subscribe write", e))?;
        }

        self.set_state(SessionState::Streaming);
        Ok(())
    }

    async fn finish(&self, transport: &mut dyn WsTransport) {
        self.closing.store(true, Ordering::SeqCst);
        self.book.lock().retire();
        self.set_state(SessionState::Closing);

        if transport.is_connected() {
            if let Err(e) = transport.close().await {
                self.logger
                    .warn(&format!("Session {}: close failed: {}", self.id, e));
            }
        }

        self.set_state(SessionState::Closed);
        self.logger.info(&format!("Session {} closed", self.id));
    }
}

fn stage_error(stage: &str, error: ExchangeError) -> ExchangeError {
    match error {
        ExchangeError::ConnectionTimeout(message) => {
            ExchangeError::ConnectionTimeout(format!("{}: {}", stage, message))
        }
        other => ExchangeError::NetworkError(format!("{} failed: {}", stage, other)),
    }
}
