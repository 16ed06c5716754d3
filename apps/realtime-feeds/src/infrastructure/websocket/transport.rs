//! WebSocket Transport
//!
//! [`Transport`] adapter over `tokio-tungstenite`. Outgoing strings become
//! text frames; incoming text (and UTF-8 binary) frames, close frames and
//! socket errors become [`SocketEvent`]s. Protocol-level pings are answered
//! by tungstenite itself.
//!
//! When a bearer token is configured it is sent as an `Authorization`
//! header on the handshake. A handshake refused with HTTP 401/403 surfaces
//! as [`TransportError::Rejected`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::application::ports::{SocketConnection, SocketEvent, Transport, TransportError};
use crate::infrastructure::config::AuthToken;

/// `tokio-tungstenite` socket transport.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteTransport {
    auth_token: Option<AuthToken>,
}

impl TungsteniteTransport {
    /// Create a transport without credentials.
    #[must_use]
    pub const fn new() -> Self {
        Self { auth_token: None }
    }

    /// Create a transport that presents `token` on every handshake.
    #[must_use]
    pub const fn with_auth_token(token: Option<AuthToken>) -> Self {
        Self { auth_token: token }
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, url: &str) -> Result<SocketConnection, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|e| TransportError::InvalidUrl(format!("invalid auth token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                WsError::Http(response) => TransportError::Rejected {
                    status: response.status().as_u16(),
                },
                other => TransportError::Connect(other.to_string()),
            })?;

        let (write, read) = stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::text(text))));

        let events = read.filter_map(|message| future::ready(socket_event(message)));

        Ok(SocketConnection::new(Box::pin(sink), Box::pin(events)))
    }
}

fn socket_event(message: Result<Message, WsError>) -> Option<SocketEvent> {
    match message {
        Ok(Message::Text(text)) => Some(SocketEvent::Frame(text.to_string())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(SocketEvent::Frame(text)),
            Err(_) => {
                tracing::warn!(len = bytes.len(), "Dropping non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Close(frame)) => Some(frame.map_or_else(
            || SocketEvent::Closed {
                code: None,
                reason: String::new(),
            },
            |frame| SocketEvent::Closed {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.to_string(),
            },
        )),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Some(SocketEvent::Closed {
            code: None,
            reason: String::new(),
        }),
        Err(e) => Some(SocketEvent::Error(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    use super::*;

    #[test]
    fn text_and_binary_frames_become_text_events() {
        assert_eq!(
            socket_event(Ok(Message::text("{\"type\":\"pong\"}"))),
            Some(SocketEvent::Frame("{\"type\":\"pong\"}".to_string()))
        );
        assert_eq!(
            socket_event(Ok(Message::binary(b"{}".to_vec()))),
            Some(SocketEvent::Frame("{}".to_string()))
        );
        assert_eq!(socket_event(Ok(Message::binary(vec![0xff, 0xfe]))), None);
    }

    #[test]
    fn close_frame_keeps_code_and_reason() {
        let frame = CloseFrame {
            code: CloseCode::from(4001),
            reason: "bad token".into(),
        };
        assert_eq!(
            socket_event(Ok(Message::Close(Some(frame)))),
            Some(SocketEvent::Closed {
                code: Some(4001),
                reason: "bad token".to_string()
            })
        );
        assert_eq!(
            socket_event(Ok(Message::Close(None))),
            Some(SocketEvent::Closed {
                code: None,
                reason: String::new()
            })
        );
    }

    #[test]
    fn control_frames_are_ignored() {
        assert_eq!(socket_event(Ok(Message::Ping(Vec::new().into()))), None);
        assert_eq!(socket_event(Ok(Message::Pong(Vec::new().into()))), None);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connect_error() {
        let transport = TungsteniteTransport::new();
        let result = transport.open("ws://127.0.0.1:1/ws/market-data").await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn malformed_url_is_rejected_before_connecting() {
        let transport = TungsteniteTransport::with_auth_token(Some(AuthToken::new("t")));
        let result = transport.open("not a url").await;
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }
}
