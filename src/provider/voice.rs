use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::VoiceSettings;
use crate::errors::AppError;
use crate::models::{AgentMode, Role};

const CONVAI_WS_URL: &str = "wss://api.elevenlabs.io/v1/convai/conversation";
const SIGNED_URL_ENDPOINT: &str =
    "https://api.elevenlabs.io/v1/convai/conversation/get_signed_url";
const EVENT_BUFFER: usize = 64;
/// Roughly three seconds of microphone chunks; beyond that audio is stale.
const OUTGOING_BUFFER: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Typed replacement for the provider's callback hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Connected,
    Disconnected,
    Error(String),
    ModeChange(AgentMode),
    Message { text: String, source: Role },
}

#[async_trait]
pub trait VoiceConnection: Send {
    /// Forwards one chunk of 16 kHz mono PCM from the microphone.
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), AppError>;

    async fn close(&mut self) -> Result<(), AppError>;
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn start(
        &self,
        agent_id: &str,
    ) -> Result<(Box<dyn VoiceConnection>, mpsc::Receiver<VoiceEvent>), AppError>;
}

/// Conversational agent transport for ElevenLabs.
pub struct ElevenLabsTransport {
    client: Client,
    api_key: Option<String>,
}

impl ElevenLabsTransport {
    pub fn new(settings: &VoiceSettings) -> Self {
        Self {
            client: Client::new(),
            api_key: settings.api_key.clone(),
        }
    }

    async fn conversation_url(&self, agent_id: &str) -> Result<String, AppError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(format!("{CONVAI_WS_URL}?agent_id={agent_id}"));
        };

        let response = self
            .client
            .get(SIGNED_URL_ENDPOINT)
            .query(&[("agent_id", agent_id)])
            .header("xi-api-key", api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::ProviderError { status: status.as_u16(), message });
        }
        let body: Value = response.json().await?;
        body["signed_url"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| AppError::connection("signed url missing from response"))
    }
}

#[async_trait]
impl VoiceTransport for ElevenLabsTransport {
    async fn start(
        &self,
        agent_id: &str,
    ) -> Result<(Box<dyn VoiceConnection>, mpsc::Receiver<VoiceEvent>), AppError> {
        let url = self.conversation_url(agent_id).await?;
        let (socket, _) = connect_async(url.as_str()).await?;
        info!("Voice conversation socket open for agent {agent_id}");

        let (mut write, mut read) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_BUFFER);
        let (events, events_rx) = mpsc::channel::<VoiceEvent>(EVENT_BUFFER);

        let initiation = json!({ "type": "conversation_initiation_client_data" });
        let _ = outgoing.try_send(Message::Text(initiation.to_string().into()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Voice socket write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let replies = outgoing.clone();
        let reader = tokio::spawn(async move {
            let mut mapper = ConvaiFrameMapper::default();
            while let Some(frame) = read.next().await {
                let value = match frame {
                    Ok(Message::Text(text)) => serde_json::from_str::<Value>(text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = events.send(VoiceEvent::Error(e.to_string())).await;
                        break;
                    }
                };
                let Ok(value) = value else {
                    debug!("Skipping non-JSON voice frame");
                    continue;
                };
                let (mapped, reply) = mapper.handle(&value);
                if let Some(reply) = reply {
                    if replies.try_send(Message::Text(reply.to_string().into())).is_err() {
                        warn!("Voice uplink congested, keep-alive reply dropped");
                    }
                }
                for event in mapped {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            let _ = events.send(VoiceEvent::Disconnected).await;
        });

        let connection = ElevenLabsConnection { outgoing, reader, writer };
        Ok((Box::new(connection), events_rx))
    }
}

struct ElevenLabsConnection {
    outgoing: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[async_trait]
impl VoiceConnection for ElevenLabsConnection {
    /// Chunks that find the uplink full are dropped rather than queued.
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), AppError> {
        let frame = json!({ "user_audio_chunk": BASE64.encode(pcm) });
        match self.outgoing.try_send(Message::Text(frame.to_string().into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Voice uplink congested, dropping {} bytes of audio", pcm.len());
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(AppError::connection("voice connection closed")),
        }
    }

    async fn close(&mut self) -> Result<(), AppError> {
        self.reader.abort();
        if self.outgoing.try_send(Message::Close(None)).is_err() {
            self.writer.abort();
        }
        // The writer exits after flushing the close frame, or is cut off.
        match tokio::time::timeout(CLOSE_GRACE, &mut self.writer).await {
            Ok(Err(e)) if !e.is_cancelled() => {
                Err(AppError::Unexpected(format!("voice writer task failed: {e}")))
            }
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Voice socket did not close within {CLOSE_GRACE:?}, aborting writer");
                self.writer.abort();
                Ok(())
            }
        }
    }
}

impl Drop for ElevenLabsConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Maps server frames onto [`VoiceEvent`]s and answers keep-alive pings.
///
/// The agent is considered speaking from the first audio frame of a turn
/// until the user is heard again or interrupts.
#[derive(Debug, Default)]
pub struct ConvaiFrameMapper {
    mode: AgentMode,
}

impl ConvaiFrameMapper {
    pub fn handle(&mut self, frame: &Value) -> (Vec<VoiceEvent>, Option<Value>) {
        let mut events = Vec::new();
        let mut reply = None;

        match frame["type"].as_str().unwrap_or_default() {
            "conversation_initiation_metadata" => events.push(VoiceEvent::Connected),
            "ping" => {
                let event_id = frame["ping_event"]["event_id"].clone();
                reply = Some(json!({ "type": "pong", "event_id": event_id }));
            }
            "audio" => self.switch(AgentMode::Speaking, &mut events),
            "interruption" => self.switch(AgentMode::Listening, &mut events),
            "user_transcript" => {
                self.switch(AgentMode::Listening, &mut events);
                if let Some(text) = frame["user_transcription_event"]["user_transcript"].as_str() {
                    events.push(VoiceEvent::Message { text: text.to_string(), source: Role::User });
                }
            }
            "agent_response" => {
                if let Some(text) = frame["agent_response_event"]["agent_response"].as_str() {
                    events.push(VoiceEvent::Message { text: text.to_string(), source: Role::Agent });
                }
            }
            "error" => {
                let message = frame["message"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| frame.to_string());
                events.push(VoiceEvent::Error(message));
            }
            other => debug!("Ignoring voice frame of type {other:?}"),
        }

        (events, reply)
    }

    fn switch(&mut self, mode: AgentMode, events: &mut Vec<VoiceEvent>) {
        if self.mode != mode {
            self.mode = mode;
            events.push(VoiceEvent::ModeChange(mode));
        }
    }
}
