pub mod core;
pub mod exchanges;

pub use crate::core::config::ExchangeConfig;
pub use crate::core::errors::ExchangeError;
pub use crate::core::kernel::WsConfig;
pub use crate::core::logging::{LogCallback, LogSeverity, Logger};
pub use crate::exchanges::okx::{OkxBuilder, WebSocketClient, WsStreamManager};
