use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::ImageSettings;
use crate::errors::AppError;

const TOKEN_URL: &str = "https://rest.alpha.fal.ai/tokens/";
const REALTIME_BASE_URL: &str = "wss://fal.run";
const TOKEN_EXPIRATION_SECS: u64 = 120;

pub fn data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{content_type};base64,{}", BASE64.encode(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Outbound image-to-image request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FalImageInput {
    pub prompt: String,
    pub negative_prompt: String,
    pub image_url: String,
    pub image_size: ImageSize,
    pub num_images: u32,
    pub sync_mode: bool,
    pub expand_prompt: bool,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub strength: f32,
    pub seed: u64,
}

/// Image bytes arrive as msgpack `bin` (or a JSON byte array) or as an
/// encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ImageContent {
    Bytes(ByteBuf),
    Encoded(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FalImage {
    #[serde(default)]
    pub content: Option<ImageContent>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl FalImage {
    /// Renders the image as a `data:` URI an `<img src>` can load. Images
    /// without inline content yield `None`.
    pub fn to_url(&self) -> Option<String> {
        let content_type = self.content_type.as_deref().unwrap_or("image/jpeg");
        match self.content.as_ref()? {
            ImageContent::Bytes(bytes) if !bytes.is_empty() => Some(data_uri(content_type, bytes)),
            ImageContent::Encoded(s) if s.starts_with("data:") => Some(s.clone()),
            ImageContent::Encoded(s) if !s.is_empty() => {
                Some(format!("data:{content_type};base64,{s}"))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FalImageOutput {
    #[serde(default)]
    pub images: Vec<FalImage>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Result(FalImageOutput),
    Error(String),
}

/// Error details are usually strings but may be structured.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Detail {
    Text(String),
    Structured(Value),
}

impl Detail {
    fn into_message(self) -> String {
        match self {
            Detail::Text(s) => s,
            Detail::Structured(v) => v.to_string(),
        }
    }
}

/// Every shape an inbound frame can take, whatever its encoding.
#[derive(Debug, Deserialize)]
struct RealtimeFrame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    images: Option<Vec<FalImage>>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    detail: Option<Detail>,
    #[serde(default)]
    error: Option<Detail>,
}

impl RealtimeFrame {
    fn into_event(self) -> Option<RealtimeEvent> {
        match self.kind.as_deref() {
            Some("x-fal-error") => {
                let reason = self
                    .reason
                    .or_else(|| self.error.map(Detail::into_message))
                    .unwrap_or_else(|| "unknown realtime error".to_string());
                return Some(RealtimeEvent::Error(reason));
            }
            Some("x-fal-message") => return None,
            _ => {}
        }
        if let Some(images) = self.images {
            return Some(RealtimeEvent::Result(FalImageOutput {
                images,
                request_id: self.request_id,
            }));
        }
        self.detail
            .or(self.error)
            .map(|detail| RealtimeEvent::Error(detail.into_message()))
    }
}

impl RealtimeEvent {
    /// Classifies a text frame. Informational frames yield `Ok(None)`.
    pub fn from_json(text: &str) -> Result<Option<Self>, String> {
        serde_json::from_str::<RealtimeFrame>(text)
            .map(RealtimeFrame::into_event)
            .map_err(|e| e.to_string())
    }

    /// Classifies a binary msgpack frame, the encoding results arrive in.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Option<Self>, String> {
        rmp_serde::from_slice::<RealtimeFrame>(bytes)
            .map(RealtimeFrame::into_event)
            .map_err(|e| e.to_string())
    }
}

/// One open realtime connection. Owned by exactly one request.
#[async_trait]
pub trait RealtimeConnection: Send {
    async fn send(&mut self, input: &FalImageInput) -> Result<(), AppError>;

    /// Next meaningful event; `None` once the connection is gone.
    async fn next_event(&mut self) -> Option<RealtimeEvent>;

    async fn close(&mut self) -> Result<(), AppError>;
}

#[async_trait]
pub trait RealtimeImageConnector: Send + Sync {
    async fn connect(&self, connection_key: &str) -> Result<Box<dyn RealtimeConnection>, AppError>;
}

pub struct FalRealtimeConnector {
    client: Client,
    api_key: Option<String>,
    app: String,
}

impl FalRealtimeConnector {
    pub fn new(settings: &ImageSettings) -> Self {
        Self {
            client: Client::new(),
            api_key: settings.api_key.clone(),
            app: settings.model.trim_matches('/').to_string(),
        }
    }

    /// `fal-ai/fast-turbo-diffusion/image-to-image` -> `fast-turbo-diffusion`
    fn app_alias(&self) -> &str {
        self.app.split('/').nth(1).unwrap_or(&self.app)
    }

    async fn fetch_token(&self, api_key: &str) -> Result<String, AppError> {
        let response = self
            .client
            .post(TOKEN_URL)
            .header(AUTHORIZATION, format!("Key {api_key}"))
            .json(&json!({
                "allowed_apps": [self.app_alias()],
                "token_expiration": TOKEN_EXPIRATION_SECS,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::ProviderError { status: status.as_u16(), message });
        }
        // The endpoint answers with a bare JSON string.
        response
            .json::<String>()
            .await
            .map_err(|e| AppError::connection(format!("invalid realtime token: {e}")))
    }
}

#[async_trait]
impl RealtimeImageConnector for FalRealtimeConnector {
    async fn connect(&self, connection_key: &str) -> Result<Box<dyn RealtimeConnection>, AppError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AppError::missing_credentials("fal"))?;

        let token = self.fetch_token(api_key).await?;
        let url = format!("{REALTIME_BASE_URL}/{}/realtime?fal_jwt_token={token}", self.app);
        let (socket, _) = connect_async(url.as_str()).await?;
        debug!("Realtime connection {connection_key} open to {}", self.app);

        let (write, read) = socket.split();
        Ok(Box::new(FalRealtimeConnection { write, read }))
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct FalRealtimeConnection {
    write: SplitSink<Socket, Message>,
    read: SplitStream<Socket>,
}

#[async_trait]
impl RealtimeConnection for FalRealtimeConnection {
    async fn send(&mut self, input: &FalImageInput) -> Result<(), AppError> {
        let payload = rmp_serde::to_vec_named(input)
            .map_err(|e| AppError::Unexpected(format!("failed to encode request: {e}")))?;
        self.write.send(Message::Binary(payload.into())).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<RealtimeEvent> {
        while let Some(frame) = self.read.next().await {
            let decoded = match frame {
                Ok(Message::Binary(bytes)) => RealtimeEvent::from_msgpack(&bytes),
                Ok(Message::Text(text)) => match RealtimeEvent::from_json(text.as_str()) {
                    Ok(event) => Ok(event),
                    Err(e) => {
                        warn!("Ignoring undecodable realtime text frame: {e}");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(RealtimeEvent::Error(e.to_string())),
            };
            match decoded {
                Ok(Some(event)) => return Some(event),
                Ok(None) => debug!("Skipping informational realtime frame"),
                Err(e) => return Some(RealtimeEvent::Error(format!("malformed result: {e}"))),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), AppError> {
        self.write.close().await?;
        Ok(())
    }
}
