//! Sandbox backend speaking to a remote provider over HTTP and websockets.
//!
//! Provider API:
//! - `POST   {base}/sandboxes/{id}/start` with `{"enable_outbound_network": bool}`
//! - `DELETE {base}/sandboxes/{id}` (404 means already gone)
//! - `GET    {ws-base}/sandboxes/{id}/ports/{port}` websocket upgrade

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use super::{SandboxBackend, SandboxHandle, SandboxStream, StartOptions};
use crate::relay::{CloseReason, Endpoint, Frame};
use crate::{AppError, Result};

#[derive(Serialize)]
struct StartRequest {
    enable_outbound_network: bool,
}

/// Backend creating [`HttpSandbox`] handles against one provider.
#[derive(Clone)]
pub struct HttpSandboxBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSandboxBackend {
    /// Build a backend for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

impl SandboxBackend for HttpSandboxBackend {
    fn handle(&self, session_id: &str) -> Arc<dyn SandboxHandle> {
        Arc::new(HttpSandbox {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            session_id: session_id.to_owned(),
        })
    }
}

/// Handle for one provider-hosted sandbox.
pub struct HttpSandbox {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl HttpSandbox {
    fn sandbox_url(&self) -> String {
        format!("{}/sandboxes/{}", self.base_url, self.session_id)
    }

    fn stream_url(&self, port: u16) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/sandboxes/{}/ports/{port}", self.session_id)
    }

    async fn start_inner(&self, options: StartOptions) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/start", self.sandbox_url()))
            .json(&StartRequest {
                enable_outbound_network: options.enable_outbound_network,
            })
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            info!(session_id = %self.session_id, "sandbox started");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(AppError::Upstream(format!(
            "sandbox start returned {status}: {body}"
        )))
    }

    async fn destroy_inner(&self) -> Result<()> {
        let resp = self.client.delete(self.sandbox_url()).send().await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(session_id = %self.session_id, %status, "sandbox destroyed");
            return Ok(());
        }
        Err(AppError::Upstream(format!(
            "sandbox destroy returned {status}"
        )))
    }

    async fn open_stream_inner(&self, port: u16, protocols: Vec<String>) -> Result<SandboxStream> {
        let mut request = self.stream_url(port).into_client_request()?;
        if !protocols.is_empty() {
            let offered = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|err| AppError::Upstream(format!("invalid sub-protocol header: {err}")))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
        }

        let (socket, response) = tokio_tungstenite::connect_async(request).await?;
        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        debug!(session_id = %self.session_id, port, ?protocol, "sandbox stream open");

        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(AppError::from)
            .with(|frame: Frame| async move { Ok::<_, AppError>(to_message(frame)) });
        let stream = stream.filter_map(|msg| async move {
            match msg {
                Ok(msg) => from_message(msg).map(Ok),
                Err(err) => Some(Err(AppError::from(err))),
            }
        });

        Ok(SandboxStream {
            endpoint: Endpoint {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            },
            protocol,
        })
    }
}

impl SandboxHandle for HttpSandbox {
    fn start(&self, options: StartOptions) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.start_inner(options))
    }

    fn destroy(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.destroy_inner())
    }

    fn open_stream(
        &self,
        port: u16,
        protocols: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<SandboxStream>> + Send + '_>> {
        Box::pin(self.open_stream_inner(port, protocols))
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Binary(bytes) => Message::Binary(bytes),
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

fn from_message(msg: Message) -> Option<Frame> {
    match msg {
        Message::Binary(bytes) => Some(Frame::Binary(bytes)),
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Close(frame) => Some(Frame::Close(frame.map(|f| CloseReason {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_owned(),
        }))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}
