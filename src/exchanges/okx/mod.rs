pub mod builder;
pub mod client;
pub mod codec;
pub mod rest;
pub mod session;
pub mod signer;
pub mod stream_manager;
pub mod types;

// Re-export main components
pub use builder::OkxBuilder;
pub use client::{TransportFactory, WebSocketClient};
pub use codec::{OkxCodec, OkxMessage};
pub use rest::OkxRest;
pub use session::{DataEventCallback, Session, SessionState};
pub use signer::OkxSigner;
pub use stream_manager::WsStreamManager;
pub use types::{
    AccountBalance, BarSize, Candle, CandlestickEvent, DataEvent, FundingRate, Instrument,
    InstrumentType, Position, Subscription, Ticker, TickerEvent,
};
