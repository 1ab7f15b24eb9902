/// Exchange-agnostic transport layer
///
/// - `ws`: staged WebSocket transport (`WsTransport`) with a network
///   implementation and an in-memory one for replay and tests
/// - `rest`: HTTP client interface and its reqwest implementation
/// - `signer`: pluggable request authentication
/// - `codec`: exchange-specific frame encoding and decoding
///
/// Nothing in here knows about OKX message shapes.
pub mod codec;
pub mod rest;
pub mod signer;
pub mod ws;

pub use codec::WsCodec;
pub use rest::{ReqwestRest, RestClient, RestClientBuilder, RestClientConfig};
pub use signer::{SignatureResult, Signer};
pub use ws::{ChannelWs, ChannelWsHandle, TungsteniteWs, WsConfig, WsTransport};
