#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use gamesmith::config::{ImageSettings, TextSettings, VoiceSettings};
use gamesmith::errors::AppError;
use gamesmith::provider::image::FalRealtimeConnector;
use gamesmith::provider::text::{ChatCompletionRequest, TextCompletionProvider, TokenStream};
use gamesmith::provider::voice::{ElevenLabsTransport, VoiceConnection, VoiceEvent, VoiceTransport};
use gamesmith::service::game_service::GameService;
use gamesmith::session::image::ImageGenerationSession;
use gamesmith::session::text::TextGenerationSession;

/// Answers each call with the next canned reply, split into small chunks.
#[derive(Default)]
pub struct CannedProvider {
    pub replies: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<ChatCompletionRequest>>,
}

#[async_trait]
impl TextCompletionProvider for CannedProvider {
    fn name(&self) -> &str {
        "canned"
    }

    async fn open_stream(&self, request: &ChatCompletionRequest) -> Result<TokenStream, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        let chunks: Vec<Result<String, AppError>> = reply
            .as_bytes()
            .chunks(16)
            .map(|c| Ok(String::from_utf8_lossy(c).into_owned()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

/// Voice transport whose events are pushed by the test.
#[derive(Default)]
pub struct ScriptedVoice {
    pub closes: Arc<AtomicUsize>,
    pub audio_bytes: Arc<AtomicUsize>,
    pub feed: Mutex<Option<mpsc::Sender<VoiceEvent>>>,
}

impl ScriptedVoice {
    pub async fn wait_for_feed(&self) -> mpsc::Sender<VoiceEvent> {
        loop {
            if let Some(tx) = self.feed.lock().unwrap().clone() {
                return tx;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct ScriptedVoiceConnection {
    closes: Arc<AtomicUsize>,
    audio_bytes: Arc<AtomicUsize>,
}

#[async_trait]
impl VoiceConnection for ScriptedVoiceConnection {
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), AppError> {
        self.audio_bytes.fetch_add(pcm.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AppError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl VoiceTransport for ScriptedVoice {
    async fn start(
        &self,
        _agent_id: &str,
    ) -> Result<(Box<dyn VoiceConnection>, mpsc::Receiver<VoiceEvent>), AppError> {
        let (tx, rx) = mpsc::channel(16);
        *self.feed.lock().unwrap() = Some(tx);
        let connection = ScriptedVoiceConnection {
            closes: Arc::clone(&self.closes),
            audio_bytes: Arc::clone(&self.audio_bytes),
        };
        Ok((Box::new(connection), rx))
    }
}

pub fn game(title: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{title}</title></head><body><canvas id=\"c\"></canvas>\
         <script type=\"module\">const ctx = document.getElementById('c').getContext('2d');</script></body></html>"
    )
}

pub fn canned(replies: &[String]) -> Arc<CannedProvider> {
    Arc::new(CannedProvider {
        replies: Mutex::new(replies.iter().cloned().collect()),
        ..Default::default()
    })
}

/// Service with the given text provider, unconfigured image credentials and
/// no voice agent.
pub fn service(provider: Arc<CannedProvider>) -> GameService {
    service_with_voice(
        provider,
        Arc::new(ElevenLabsTransport::new(&VoiceSettings::default())),
        None,
    )
}

pub fn service_with_voice(
    provider: Arc<CannedProvider>,
    voice: Arc<dyn VoiceTransport>,
    agent_id: Option<String>,
) -> GameService {
    GameService::new(
        TextGenerationSession::new(provider, TextSettings::default()),
        ImageGenerationSession::new(
            Arc::new(FalRealtimeConnector::new(&ImageSettings::default())),
            ImageSettings::default(),
        ),
        voice,
        agent_id,
    )
}
