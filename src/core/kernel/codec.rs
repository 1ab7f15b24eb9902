use crate::core::errors::ExchangeError;
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for exchange-specific WebSocket message encoding/decoding
///
/// Converts between raw WebSocket frames and typed exchange messages. Control
/// frames (ping, pong, close) belong to the transport and never reach a codec.
pub trait WsCodec: Send + Sync + 'static {
    /// Identifies one stream on the exchange
    type Subscription: Send + Sync;

    /// The type representing parsed messages from this exchange
    type Message: Send + Sync;

    /// Encode a subscription request into a WebSocket message
    fn encode_subscription(
        &self,
        subscriptions: &[Self::Subscription],
    ) -> Result<Message, ExchangeError>;

    /// Decode a raw WebSocket message into a typed message
    ///
    /// # Returns
    /// - `Ok(Some(message))` - Successfully decoded message
    /// - `Ok(None)` - Message was ignored/filtered by codec
    /// - `Err(error)` - Failed to decode message
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError>;
}
