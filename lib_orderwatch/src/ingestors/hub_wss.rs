//! # SignalR WebSocket Transport
//!
//! Connects to the order hub with `tokio-tungstenite`, performs the JSON
//! protocol handshake and turns incoming text frames into [`HubFrame`]s.
//! Reconnecting is not this module's job; the connection manager calls
//! [`SignalRConnector::connect`] again when a session drops.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::hub_protocol::{
    decode_messages, handshake_request, parse_handshake_response, ping_message, with_access_token,
    RECORD_SEPARATOR,
};
use crate::core::{HubConnector, HubFrame, HubTransport};
use crate::error::{WatchError, WatchResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens SignalR hub sessions.
#[derive(Debug, Clone)]
pub struct SignalRConnector {
    handshake_timeout: Duration,
    access_token: Option<String>,
}

impl Default for SignalRConnector {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            access_token: None,
        }
    }
}

impl SignalRConnector {
    /// Connector with a 15s handshake deadline and no token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `token` as the `access_token` query parameter.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Overrides the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl HubConnector for SignalRConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, WatchResult<Box<dyn HubTransport>>> {
        let url = url.to_string();
        let token = self.access_token.clone();
        let limit = self.handshake_timeout;
        Box::pin(async move {
            let opened = tokio::time::timeout(limit, SignalRTransport::open(&url, token.as_deref()))
                .await
                .map_err(|_| WatchError::Connection(format!("hub handshake timed out after {:?}", limit)))?;
            Ok(Box::new(opened?) as Box<dyn HubTransport>)
        })
    }
}

/// One live hub session over WebSocket.
pub struct SignalRTransport {
    ws: WsStream,
    pending: VecDeque<WatchResult<HubFrame>>,
}

impl SignalRTransport {
    /// Connects to `url` and completes the handshake.
    pub async fn open(url: &str, access_token: Option<&str>) -> WatchResult<Self> {
        let mut target =
            Url::parse(url).map_err(|e| WatchError::Connection(format!("invalid hub URL '{}': {}", url, e)))?;
        if let Some(token) = access_token {
            with_access_token(&mut target, token);
        }

        let (mut ws, _) = connect_async(target.as_str())
            .await
            .map_err(|e| WatchError::Connection(e.to_string()))?;
        log::debug!("WebSocket open to {}, sending handshake", url);

        ws.send(WsMessage::Text(handshake_request().into()))
            .await
            .map_err(|e| WatchError::Connection(format!("failed to send handshake: {}", e)))?;

        let mut reply = String::new();
        while !reply.contains(RECORD_SEPARATOR) {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => reply.push_str(text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(WatchError::Connection(format!(
                        "hub closed during handshake: {}",
                        reason
                    )));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(WatchError::Connection(e.to_string())),
                None => return Err(WatchError::Connection("hub closed during handshake".into())),
            }
        }

        let rest = parse_handshake_response(&reply)?;
        let pending = decode_messages(rest).into_iter().collect();
        Ok(Self { ws, pending })
    }
}

impl HubTransport for SignalRTransport {
    fn next_frame(&mut self) -> BoxFuture<'_, Option<WatchResult<HubFrame>>> {
        Box::pin(async move {
            loop {
                if let Some(frame) = self.pending.pop_front() {
                    return Some(frame);
                }
                match self.ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        log::trace!("Hub frame: {}", text.as_str());
                        self.pending.extend(decode_messages(text.as_str()));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        self.pending.push_back(Err(WatchError::Protocol(format!(
                            "unexpected binary frame ({} bytes)",
                            data.len()
                        ))));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let error = frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty());
                        return Some(Ok(HubFrame::Close { error }));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Some(Err(WatchError::TransportDrop(e.to_string()))),
                    None => return None,
                }
            }
        })
    }

    fn send_ping(&mut self) -> BoxFuture<'_, WatchResult<()>> {
        Box::pin(async move {
            self.ws
                .send(WsMessage::Text(ping_message().into()))
                .await
                .map_err(|e| WatchError::TransportDrop(e.to_string()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.ws.close(None).await {
                log::debug!("Hub close: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::future::Future;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerWs = WebSocketStream<TcpStream>;

    async fn hub_server<H, Fut>(handler: H) -> String
    where
        H: FnOnce(ServerWs) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{}/OrdersHub", addr)
    }

    async fn next_text(ws: &mut ServerWs) -> String {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return text.to_string(),
                Some(Ok(_)) => continue,
                other => panic!("expected text, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn handshake_then_frames_then_close() {
        let url = hub_server(|mut ws| async move {
            let handshake = next_text(&mut ws).await;
            assert_eq!(handshake, handshake_request());
            let reply = "{}\u{1e}{\"type\":1,\"target\":\"AssignOrder\",\"arguments\":[42,true]}\u{1e}";
            ws.send(WsMessage::Text(reply.into())).await.unwrap();
            ws.send(WsMessage::Text("{\"type\":6}\u{1e}".into())).await.unwrap();

            let ping = next_text(&mut ws).await;
            assert_eq!(ping, ping_message());
            ws.send(WsMessage::Text("{\"type\":7,\"error\":\"bye\"}\u{1e}".into()))
                .await
                .unwrap();
            let _ = ws.next().await;
        })
        .await;

        let mut transport = SignalRConnector::new().connect(&url).await.unwrap();
        assert_eq!(
            transport.next_frame().await.unwrap().unwrap(),
            HubFrame::Invocation {
                target: "AssignOrder".into(),
                arguments: vec![json!(42), json!(true)],
            }
        );
        assert_eq!(transport.next_frame().await.unwrap().unwrap(), HubFrame::Ping);
        transport.send_ping().await.unwrap();
        assert_eq!(
            transport.next_frame().await.unwrap().unwrap(),
            HubFrame::Close {
                error: Some("bye".into())
            }
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn rejected_handshake_is_a_connection_error() {
        let url = hub_server(|mut ws| async move {
            let _ = next_text(&mut ws).await;
            let reply = "{\"error\":\"Requested protocol 'json' is not available.\"}\u{1e}";
            ws.send(WsMessage::Text(reply.into())).await.unwrap();
        })
        .await;

        let err = SignalRConnector::new().connect(&url).await.err().unwrap();
        assert!(matches!(err, WatchError::Connection(msg) if msg.contains("not available")));
    }

    #[tokio::test]
    async fn silent_server_times_out_the_handshake() {
        let url = hub_server(|mut ws| async move {
            let _ = next_text(&mut ws).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let connector = SignalRConnector::new().with_handshake_timeout(Duration::from_millis(200));
        let err = connector.connect(&url).await.err().unwrap();
        assert!(matches!(err, WatchError::Connection(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn unreachable_hub_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = SignalRConnector::new()
            .connect(&format!("ws://{}/OrdersHub", addr))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WatchError::Connection(_)));
    }
}
