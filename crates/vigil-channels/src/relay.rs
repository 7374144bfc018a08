use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use vigil_config::schema::TransportConfig;
use vigil_core::{Result as VigilResult, VigilError};

use crate::adapter::*;

/// A generic JSON message relay: REST for send/typing/history and a
/// WebSocket for the live stream.
///
/// ```toml
/// [transport]
/// kind = "relay"
/// relay_url = "https://relay.example.net"
/// token = "..."            # or VIGIL_RELAY_TOKEN
/// ```
///
/// | Call                 | Request                                  |
/// |----------------------|------------------------------------------|
/// | send                 | `POST {relay}/messages`                  |
/// | typing               | `POST {relay}/typing`                    |
/// | history              | `GET  {relay}/messages?since=<id>`       |
/// | stream               | `WS   {stream}` (default `{relay}/stream`) |
pub struct RelayTransport {
    client: reqwest::Client,
    relay_url: String,
    stream_url: String,
    token: Option<String>,
}

/// Frames on the stream socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayFrame {
    Message { message: InboundMessage },
    Ping,
    Error { reason: String },
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    messages: Vec<InboundMessage>,
}

#[derive(Debug, Deserialize)]
struct SendAck {
    id: Option<String>,
}

impl RelayTransport {
    pub fn new(relay_url: &str, stream_url: Option<&str>, token: Option<String>) -> VigilResult<Self> {
        let relay_url = relay_url.trim_end_matches('/').to_string();
        let stream_url = match stream_url {
            Some(s) => s.to_string(),
            None => derive_stream_url(&relay_url)?,
        };
        Ok(Self {
            client: reqwest::Client::new(),
            relay_url,
            stream_url,
            token,
        })
    }

    pub fn from_config(config: &TransportConfig) -> VigilResult<Self> {
        let relay_url = config.relay_url.as_deref().ok_or_else(|| VigilError::ConfigurationMissing {
            what: "transport.relay_url".into(),
            hint: "set relay_url under [transport] or use kind = \"none\"".into(),
        })?;
        Self::new(relay_url, config.stream_url.as_deref(), config.token.clone())
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }
}

/// `https://host/base` → `wss://host/base/stream`.
pub fn derive_stream_url(relay_url: &str) -> VigilResult<String> {
    let mut url = url::Url::parse(relay_url)
        .map_err(|e| VigilError::Config(format!("invalid transport.relay_url '{relay_url}': {e}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(VigilError::Config(format!("unsupported relay scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| VigilError::Config(format!("cannot derive stream url from '{relay_url}'")))?;
    let path = format!("{}/stream", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

fn classify_status(status: u16, body: &str) -> TransportError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    match status {
        401 | 403 => TransportError::Auth(detail),
        _ => TransportError::Transient(detail),
    }
}

fn network_error(e: reqwest::Error) -> TransportError {
    TransportError::Transient(e.to_string())
}

#[async_trait]
impl Transport for RelayTransport {
    fn name(&self) -> &str {
        "relay"
    }

    async fn connect(&self) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        let mut request = self
            .stream_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Transient(format!("bad stream url: {e}")))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Auth(format!("token is not a valid header value: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(resp)) => {
                return Err(classify_status(resp.status().as_u16(), "stream handshake rejected"));
            }
            Err(e) => return Err(TransportError::Transient(e.to_string())),
        };
        info!(url = %self.stream_url, "relay stream connected");

        let (tx, rx) = mpsc::channel(256);
        let (_write, mut read) = ws.split();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error(TransportError::Transient(e.to_string()))).await;
                        return;
                    }
                };
                if frame.is_close() {
                    debug!("relay closed the stream");
                    return;
                }
                if !frame.is_text() {
                    continue;
                }
                let Ok(text) = frame.to_text() else { continue };
                let event = match serde_json::from_str::<RelayFrame>(text) {
                    Ok(RelayFrame::Message { message }) => StreamEvent::Message(message),
                    Ok(RelayFrame::Ping) => continue,
                    Ok(RelayFrame::Error { reason }) => {
                        let _ = tx.send(StreamEvent::Error(TransportError::Transient(reason))).await;
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "ignoring unparseable relay frame");
                        continue;
                    }
                };
                if tx.send(event).await.is_err() {
                    // Supervisor dropped the stream.
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt, TransportError> {
        let resp = self
            .authorized(self.client.post(format!("{}/messages", self.relay_url)))
            .json(&json!({ "conversation_id": conversation_id, "text": text }))
            .send()
            .await
            .map_err(network_error)?;
        let resp = Self::check(resp).await?;
        let ack: SendAck = resp.json().await.unwrap_or(SendAck { id: None });
        Ok(DeliveryReceipt::new(ack.id))
    }

    async fn poll_history_since(&self, cursor: Option<&str>) -> Result<Vec<InboundMessage>, TransportError> {
        let mut req = self.authorized(self.client.get(format!("{}/messages", self.relay_url)));
        if let Some(cursor) = cursor {
            req = req.query(&[("since", cursor)]);
        }
        let resp = Self::check(req.send().await.map_err(network_error)?).await?;
        let page: HistoryPage = resp
            .json()
            .await
            .map_err(|e| TransportError::Transient(format!("malformed history page: {e}")))?;
        Ok(page.messages)
    }

    async fn set_typing(&self, conversation_id: &str, on: bool) -> Result<(), TransportError> {
        let resp = self
            .authorized(self.client.post(format!("{}/typing", self.relay_url)))
            .json(&json!({ "conversation_id": conversation_id, "on": on }))
            .send()
            .await
            .map_err(network_error)?;
        Self::check(resp).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_stream_url() {
        assert_eq!(
            derive_stream_url("https://relay.example.net").unwrap(),
            "wss://relay.example.net/stream"
        );
        assert_eq!(
            derive_stream_url("http://localhost:8080/api/").unwrap(),
            "ws://localhost:8080/api/stream"
        );
        assert!(derive_stream_url("ftp://x").is_err());
        assert!(derive_stream_url("not a url").is_err());
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(401, "").is_auth());
        assert!(classify_status(403, "").is_auth());
        assert!(!classify_status(503, "").is_auth());
        assert!(!classify_status(429, "").is_auth());
    }

    #[test]
    fn test_relay_frame_parsing() {
        let raw = r#"{"type":"message","message":{"id":"m1","conversation_id":"c1","sender":"op","text":"hi","sent_at":"2026-01-01T00:00:00Z"}}"#;
        match serde_json::from_str::<RelayFrame>(raw).unwrap() {
            RelayFrame::Message { message } => assert_eq!(message.id, "m1"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(
            serde_json::from_str::<RelayFrame>(r#"{"type":"ping"}"#).unwrap(),
            RelayFrame::Ping
        ));
    }

    #[test]
    fn test_from_config_requires_url() {
        let config = TransportConfig::default();
        assert!(matches!(
            RelayTransport::from_config(&config),
            Err(VigilError::ConfigurationMissing { .. })
        ));
    }
}
