//! WebSocket channel to the relay.
//!
//! Text frames carry [`WireMessage`] JSON. Binary frames are not part of
//! the protocol and are dropped. Protocol-level ping/pong control frames
//! are answered by tungstenite itself.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::protocol::{ProtocolError, WireMessage};
use crate::session::SessionError;

pub type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the controller needs to know about the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Frame(WireMessage),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Open the WebSocket channel.
pub async fn connect(url: &Url) -> Result<RelayStream, SessionError> {
    log::info!("Connecting to {}", redact(url));
    let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| SessionError::Connect(e.to_string()))?;
    Ok(stream)
}

/// Map one inbound WebSocket message to a transport event. Malformed text
/// frames are logged and dropped.
pub fn decode_frame(message: Message) -> Option<TransportEvent> {
    match message {
        Message::Text(text) => match WireMessage::decode(text.as_str()) {
            Ok(frame) => Some(TransportEvent::Frame(frame)),
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                None
            }
        },
        Message::Close(frame) => Some(TransportEvent::Closed {
            code: frame.as_ref().map(|f| u16::from(f.code)),
            reason: frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default(),
        }),
        Message::Binary(data) => {
            log::debug!("Ignoring {}-byte binary frame", data.len());
            None
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

pub fn encode_frame(message: &WireMessage) -> Result<Message, ProtocolError> {
    Ok(Message::Text(message.encode()?.into()))
}

pub fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// The connect URL without its credential, for logs.
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
