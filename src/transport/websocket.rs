//! WebSocket Transport
//!
//! Accepts WebSocket clients and splits each socket into a [`WsSink`]
//! (the connection's outbound capability) and a stream of [`Inbound`]
//! frames for the session loop.

use std::io;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::Inbound;
use crate::connection::{ClientSink, SendError};

/// Outbound half of a WebSocket client
pub struct WsSink<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

impl<S> WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Split an established WebSocket into its sink and inbound frames
    pub fn split(ws: WebSocketStream<S>) -> (Self, BoxStream<'static, Inbound>) {
        let (sink, stream) = ws.split();
        (
            Self {
                sink: Mutex::new(sink),
            },
            inbound_frames(stream),
        )
    }

    /// Accept a WebSocket handshake, validating the request path.
    pub async fn accept_with_path(
        stream: S,
        expected_path: &str,
        max_message_size: usize,
    ) -> Result<(Self, BoxStream<'static, Inbound>), io::Error> {
        let expected_path = expected_path.to_string();

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(max_message_size);
        config.max_frame_size = Some(max_message_size);

        let ws = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            move |req: &Request, response: Response| {
                let request_path = req.uri().path();
                if request_path != expected_path {
                    let mut error = ErrorResponse::new(Some(format!(
                        "Invalid path: expected '{}', got '{}'",
                        expected_path, request_path
                    )));
                    *error.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
                    return Err(error);
                }
                Ok(response)
            },
            Some(config),
        )
        .await
        .map_err(io::Error::other)?;

        Ok(Self::split(ws))
    }
}

#[async_trait]
impl<S> ClientSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, text: &str) -> Result<(), SendError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => SendError::Closed,
                e => SendError::Transport(e.to_string()),
            })
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("WebSocket close frame not sent: {}", e);
        }
    }
}

/// Map raw frames to inbound client activity.
///
/// Text frames carry protocol messages, binary frames are read as UTF-8
/// text, and control frames only count as activity. The stream ends on a
/// Close frame or a read error.
fn inbound_frames<S>(stream: SplitStream<WebSocketStream<S>>) -> BoxStream<'static, Inbound>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    stream::unfold(stream, |mut stream| async move {
        loop {
            let inbound = match stream.next().await? {
                Ok(Message::Text(text)) => Inbound::Text(text),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => Inbound::Text(text),
                    Err(_) => Inbound::Invalid("binary frame is not valid UTF-8".to_string()),
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Inbound::Activity,
                Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    debug!("WebSocket read error: {}", e);
                    return None;
                }
            };
            return Some((inbound, stream));
        }
    })
    .boxed()
}
