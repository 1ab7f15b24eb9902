use crate::core::errors::ExchangeError;
use crate::core::kernel::ws::{TungsteniteWs, WsConfig, WsTransport};
use crate::core::logging::{LogCallback, Logger};
use crate::exchanges::okx::session::{DataEventCallback, Session};
use crate::exchanges::okx::types::Subscription;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;

/// Creates the transport for each new session
pub type TransportFactory = Arc<dyn Fn(&WsConfig) -> Box<dyn WsTransport> + Send + Sync>;

/// OKX public WebSocket client.
///
/// Owns one background thread running the event loop and at most one live
/// [`Session`]. Subscriptions are multiplexed over that session; when it has
/// retired, the next `subscribe` starts a fresh one.
pub struct WebSocketClient {
    config: WsConfig,
    runtime: Option<Arc<Runtime>>,
    handle: Handle,
    session: Mutex<Option<Session>>,
    logger: Logger,
    data_callback: Arc<RwLock<Option<DataEventCallback>>>,
    transport_factory: TransportFactory,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl WebSocketClient {
    pub fn new(config: WsConfig) -> Result<Self, ExchangeError> {
        let factory: TransportFactory = Arc::new(|config: &WsConfig| {
            Box::new(TungsteniteWs::new("okx".to_string(), config.connect_timeout()))
                as Box<dyn WsTransport>
        });
        Self::with_transport_factory(config, factory)
    }

    /// Client whose sessions use transports from `factory`
    pub fn with_transport_factory(
        config: WsConfig,
        factory: TransportFactory,
    ) -> Result<Self, ExchangeError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ExchangeError::Other(format!("Failed to build event loop: {}", e)))?;
        let handle = runtime.handle().clone();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            runtime: Some(Arc::new(runtime)),
            handle,
            session: Mutex::new(None),
            logger: Logger::new(),
            data_callback: Arc::new(RwLock::new(None)),
            transport_factory: factory,
            io_thread: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background event loop. Subsequent calls do nothing.
    pub fn run(&self) -> Result<(), ExchangeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(runtime) = self.runtime.clone() else {
            return Err(ExchangeError::Other("event loop already shut down".to_string()));
        };
        let mut shutdown = self.shutdown.subscribe();
        let logger = self.logger.clone();

        let thread = std::thread::Builder::new()
            .name("okx-ws-io".to_string())
            .spawn(move || loop {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    runtime.block_on(async {
                        // Err only when the sender is gone, which also means stop
                        let _ = shutdown.wait_for(|stop| *stop).await;
                    });
                }));

                match result {
                    Ok(()) => break,
                    Err(_) => logger.error("WebSocket event loop panicked, restarting"),
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ExchangeError::Other(format!("Failed to start event loop thread: {}", e))
            })?;

        *self.io_thread.lock() = Some(thread);
        Ok(())
    }

    /// Subscribe over the live session, or start a new one carrying `subscription`
    pub fn subscribe(&self, subscription: Subscription) -> Result<(), ExchangeError> {
        let mut slot = self.session.lock();

        if let Some(session) = slot.as_ref() {
            if session.is_alive() && session.subscribe(subscription.clone()) {
                return Ok(());
            }
        }

        let session = Session::new(self.config.clone(), self.logger.clone());
        let transport = (self.transport_factory)(&self.config);
        let task = session.run(
            transport,
            &self.config.host,
            self.config.port,
            vec![subscription],
            self.forward_data(),
        )?;
        self.handle.spawn(task);
        *slot = Some(session);
        Ok(())
    }

    /// False when there is no live session
    pub fn is_subscribed(&self, subscription: &Subscription) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.is_alive() && session.is_subscribed(subscription))
    }

    /// Current session handle, live or not
    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    pub fn set_data_event_callback(&self, callback: DataEventCallback) {
        *self.data_callback.write() = Some(callback);
    }

    pub fn set_logger_callback(&self, callback: LogCallback) {
        self.logger.set_callback(callback);
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    // Sessions keep this closure; it reads the slot on every event
    fn forward_data(&self) -> DataEventCallback {
        let slot = self.data_callback.clone();
        Arc::new(move |event| {
            let callback = slot.read().clone();
            if let Some(callback) = callback {
                callback(event);
            }
        })
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.lock().take() {
            session.close();
        }

        self.shutdown.send_replace(true);

        if let Some(thread) = self.io_thread.lock().take() {
            if thread.join().is_err() {
                self.logger.error("WebSocket event loop thread panicked");
            }
        }

        // shutdown_background is also allowed inside an async context
        if let Some(runtime) = self.runtime.take() {
            if let Ok(runtime) = Arc::try_unwrap(runtime) {
                runtime.shutdown_background();
            }
        }
    }
}
