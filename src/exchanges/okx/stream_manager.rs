use crate::core::errors::ExchangeError;
use crate::core::kernel::ws::WsConfig;
use crate::core::logging::{LogCallback, Logger};
use crate::exchanges::okx::client::WebSocketClient;
use crate::exchanges::okx::types::{BarSize, CandlestickEvent, DataEvent, Subscription, TickerEvent};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seconds a read waits for a first value by default
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;

const TICKERS_CHANNEL: &str = "tickers";

/// Latest value per key, with waiters woken on every store
struct EventCache<K, V> {
    entries: Mutex<HashMap<K, V>>,
    updated: Condvar,
}

impl<K: Eq + Hash, V: Clone> EventCache<K, V> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            updated: Condvar::new(),
        }
    }

    fn store(&self, key: K, value: V) {
        self.entries.lock().insert(key, value);
        self.updated.notify_all();
    }

    /// A timeout too large to express as a deadline waits without one
    fn wait_for(&self, key: &K, timeout: Duration) -> Option<V> {
        let deadline = Instant::now().checked_add(timeout);
        let mut entries = self.entries.lock();

        loop {
            if let Some(value) = entries.get(key) {
                return Some(value.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.updated.wait_until(&mut entries, deadline).timed_out() {
                        return entries.get(key).cloned();
                    }
                }
                None => self.updated.wait(&mut entries),
            }
        }
    }
}

struct StreamCaches {
    tickers: EventCache<String, TickerEvent>,
    candles: EventCache<(String, BarSize), CandlestickEvent>,
}

impl StreamCaches {
    // Runs on the network thread
    fn on_data_event(&self, logger: &Logger, event: &DataEvent) {
        if event.channel == TICKERS_CHANNEL {
            match serde_json::from_value::<TickerEvent>(event.data.clone()) {
                Ok(tickers) => self.tickers.store(event.inst_id.clone(), tickers),
                Err(e) => logger.warn(&format!(
                    "Dropping ticker event for {}: {}",
                    event.inst_id, e
                )),
            }
            return;
        }

        let Some(bar) = BarSize::from_channel(&event.channel) else {
            logger.warn(&format!("Ignoring event on channel {}", event.channel));
            return;
        };

        match serde_json::from_value::<CandlestickEvent>(event.data.clone()) {
            Ok(candles) => self.candles.store((event.inst_id.clone(), bar), candles),
            Err(e) => logger.warn(&format!(
                "Dropping {} event for {}: {}",
                event.channel, event.inst_id, e
            )),
        }
    }
}

/// Polling access to live tickers and candlesticks.
///
/// Subscriptions go through one [`WebSocketClient`]. Every decoded event
/// replaces the cached value for its instrument (and bar), and reads return
/// that latest value, waiting up to the configured timeout for the first one.
pub struct WsStreamManager {
    client: WebSocketClient,
    caches: Arc<StreamCaches>,
    timeout_secs: AtomicU64,
}

impl WsStreamManager {
    pub fn new(config: WsConfig) -> Result<Self, ExchangeError> {
        Ok(Self::with_client(WebSocketClient::new(config)?))
    }

    /// Take over `client` and route its data events into the caches
    pub fn with_client(client: WebSocketClient) -> Self {
        let caches = Arc::new(StreamCaches {
            tickers: EventCache::new(),
            candles: EventCache::new(),
        });

        let sink = caches.clone();
        let logger = client.logger().clone();
        client.set_data_event_callback(Arc::new(move |event: &DataEvent| {
            sink.on_data_event(&logger, event);
        }));

        Self {
            client,
            caches,
            timeout_secs: AtomicU64::new(DEFAULT_READ_TIMEOUT_SECS),
        }
    }

    pub fn client(&self) -> &WebSocketClient {
        &self.client
    }

    pub fn subscribe_tickers_stream(&self, inst_id: &str) -> Result<(), ExchangeError> {
        self.subscribe(Subscription::tickers(inst_id))
    }

    pub fn subscribe_candlestick_stream(
        &self,
        inst_id: &str,
        bar: BarSize,
    ) -> Result<(), ExchangeError> {
        self.subscribe(Subscription::candles(inst_id, bar))
    }

    fn subscribe(&self, subscription: Subscription) -> Result<(), ExchangeError> {
        if !self.client.is_subscribed(&subscription) {
            self.client
                .logger()
                .info(&format!("subscribing: {}", subscription.canonical()));
            self.client.subscribe(subscription)?;
        }

        self.client.run()
    }

    /// Zero makes reads return immediately; a timeout past the clock's range never expires
    pub fn set_timeout(&self, seconds: u64) {
        self.timeout_secs.store(seconds, Ordering::SeqCst);
    }

    pub fn timeout(&self) -> u64 {
        self.timeout_secs.load(Ordering::SeqCst)
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout())
    }

    /// Latest ticker event for `inst_id`, waiting at most the timeout
    pub fn read_event_instrument_info(&self, inst_id: &str) -> Option<TickerEvent> {
        self.caches
            .tickers
            .wait_for(&inst_id.to_string(), self.read_timeout())
    }

    /// Latest candlestick event for `inst_id` and `bar`, waiting at most the timeout
    pub fn read_event_candlestick(&self, inst_id: &str, bar: BarSize) -> Option<CandlestickEvent> {
        self.caches
            .candles
            .wait_for(&(inst_id.to_string(), bar), self.read_timeout())
    }

    pub fn set_logger_callback(&self, callback: LogCallback) {
        self.client.set_logger_callback(callback);
    }
}
