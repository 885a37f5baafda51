//! WebSocket transport seam.
//!
//! The session only sees [`Frame`]s flowing through a boxed sink/stream pair,
//! so the socket can be swapped for an in-memory link in tests.

use crate::config::{API_KEY_HEADER, ConnectRequest};
use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use secrecy::ExposeSecret;
use std::pin::Pin;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{CloseFrame, Message as WsMessage, frame::coding::CloseCode},
    },
};
use tracing::{debug, info};

/// Close code for a normal, intentional closure.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn normal() -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: String::new(),
        }
    }
}

/// The only frames the session exchanges with the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<CloseInfo>),
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open connection, already split into its two halves.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens links to the conversational service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Link, TransportError>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Link, TransportError> {
        let mut ws_request = request.url.as_str().into_client_request()?;
        if let Some(api_key) = &request.api_key_header {
            let value = HeaderValue::from_str(api_key.expose_secret())
                .map_err(|e| TransportError::Request(e.to_string()))?;
            ws_request.headers_mut().insert(API_KEY_HEADER, value);
        }

        let (ws_stream, _) = connect_async(ws_request).await?;
        info!(url = %request.redacted_url(), "WebSocket connection established");
        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_ws_message(frame))));
        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
                Ok(WsMessage::Close(close)) => Some(Ok(Frame::Close(close.map(|c| CloseInfo {
                    code: c.code.into(),
                    reason: c.reason.to_string(),
                })))),
                Ok(other) => {
                    debug!(len = other.len(), "Ignoring non-text WebSocket frame");
                    None
                }
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_ws_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Close(info) => WsMessage::Close(info.map(|info| CloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_mapping() {
        let msg = to_ws_message(Frame::Close(Some(CloseInfo::normal())));
        match msg {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), NORMAL_CLOSURE);
                assert!(frame.reason.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_text_frame_mapping() {
        let msg = to_ws_message(Frame::Text("{\"type\":\"pong\"}".into()));
        assert_eq!(msg.to_text().unwrap(), "{\"type\":\"pong\"}");
    }
}
