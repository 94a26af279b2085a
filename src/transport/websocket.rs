//! WebSocket transport
//!
//! Adapts a tokio-tungstenite stream to the frame reader/writer traits.
//! tungstenite answers peer pings on its own; we only surface them.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};

use super::{Control, Frame, FrameReader, FrameWriter, TransportError, TransportResult};
use async_trait::async_trait;

type WsStream = WebSocketStream<TcpStream>;

impl From<WsError> for TransportError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                TransportError::FrameTooLarge {
                    size,
                    limit: max_size,
                }
            }
            WsError::Io(e) => TransportError::Io(e),
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::WebSocket(other),
        }
    }
}

/// tungstenite settings that enforce the inbound frame limit at the protocol layer
pub fn websocket_config(max_frame_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_size);
    config.max_frame_size = Some(max_frame_size);
    config
}

/// Complete the WebSocket handshake on an accepted TCP stream
///
/// Only requests for `path` are upgraded; anything else is answered with 404.
/// A peer that has not finished the upgrade within `handshake_timeout` is
/// dropped.
pub async fn accept(
    stream: TcpStream,
    path: &str,
    max_frame_size: usize,
    handshake_timeout: Duration,
) -> TransportResult<(WsReader, WsWriter)> {
    let expected = path.to_string();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == expected {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some(format!(
                "No WebSocket endpoint at {}",
                request.uri().path()
            )));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let handshake =
        accept_hdr_async_with_config(stream, callback, Some(websocket_config(max_frame_size)));
    let ws_stream = time::timeout(handshake_timeout, handshake)
        .await
        .map_err(|_| TransportError::HandshakeTimeout(handshake_timeout))??;
    Ok(split(ws_stream))
}

/// Split an upgraded stream into its two directions
pub fn split(ws_stream: WsStream) -> (WsReader, WsWriter) {
    let (sink, stream) = ws_stream.split();
    (WsReader { stream }, WsWriter { sink })
}

/// Read half of a WebSocket connection
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

/// Write half of a WebSocket connection
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> TransportResult<Option<Frame>> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => return Ok(None),
            };

            let frame = match message {
                Message::Text(text) => Frame::Data(text.into_bytes()),
                Message::Binary(data) => Frame::Data(data),
                Message::Ping(data) => Frame::Ping(data),
                Message::Pong(data) => Frame::Pong(data),
                Message::Close(_) => Frame::Close,
                // Raw frames never surface while reading
                Message::Frame(_) => continue,
            };
            return Ok(Some(frame));
        }
    }
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, payload: Vec<u8>) -> TransportResult<()> {
        let message = match String::from_utf8(payload) {
            Ok(text) => Message::Text(text),
            Err(err) => Message::Binary(err.into_bytes()),
        };
        self.sink.send(message).await?;
        Ok(())
    }

    async fn write_control(&mut self, kind: Control) -> TransportResult<()> {
        let message = match kind {
            Control::Ping => Message::Ping(Vec::new()),
            Control::Close => Message::Close(None),
        };
        self.sink.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_limits() {
        let config = websocket_config(512);
        assert_eq!(config.max_message_size, Some(512));
        assert_eq!(config.max_frame_size, Some(512));
    }

    #[test]
    fn test_capacity_error_maps_to_frame_too_large() {
        let err = WsError::Capacity(CapacityError::MessageTooLong {
            size: 1024,
            max_size: 512,
        });
        match TransportError::from(err) {
            TransportError::FrameTooLarge { size, limit } => {
                assert_eq!(size, 1024);
                assert_eq!(limit, 512);
            }
            other => panic!("Expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_errors_map_to_closed() {
        assert!(matches!(
            TransportError::from(WsError::ConnectionClosed),
            TransportError::Closed
        ));
        assert!(matches!(
            TransportError::from(WsError::AlreadyClosed),
            TransportError::Closed
        ));
    }
}
