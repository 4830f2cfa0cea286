use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::extraction::extract_document;
use crate::iteration::IterationStore;
use crate::models::{GeneratedImage, GenerationResult, ImageRequest, IterationResponse};
use crate::provider::image::{FalRealtimeConnector, RealtimeImageConnector};
use crate::provider::text::{TextCompletionProvider, TogetherTextProvider};
use crate::provider::voice::{ElevenLabsTransport, VoiceTransport};
use crate::session::image::ImageGenerationSession;
use crate::session::text::{GenerationStream, TextGenerationSession};
use crate::session::voice::ConversationSession;

/// Orchestrates iterations: the only code that writes to the
/// [`IterationStore`], and only after a session reports success.
#[derive(Clone)]
pub struct GameService {
    text: Arc<TextGenerationSession>,
    image: Arc<ImageGenerationSession>,
    voice: Arc<dyn VoiceTransport>,
    voice_agent_id: Option<String>,
    store: Arc<IterationStore>,
}

impl GameService {
    pub fn new(
        text: TextGenerationSession,
        image: ImageGenerationSession,
        voice: Arc<dyn VoiceTransport>,
        voice_agent_id: Option<String>,
    ) -> Self {
        Self {
            text: Arc::new(text),
            image: Arc::new(image),
            voice,
            voice_agent_id,
            store: Arc::new(IterationStore::new()),
        }
    }

    /// Wires the real providers from configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let text_provider: Arc<dyn TextCompletionProvider> =
            Arc::new(TogetherTextProvider::new(&config.text));
        let image_connector: Arc<dyn RealtimeImageConnector> =
            Arc::new(FalRealtimeConnector::new(&config.image));

        Self::new(
            TextGenerationSession::new(text_provider, config.text.clone()),
            ImageGenerationSession::new(image_connector, config.image.clone()),
            Arc::new(ElevenLabsTransport::new(&config.voice)),
            config.voice.agent_id.clone(),
        )
    }

    pub fn store(&self) -> &Arc<IterationStore> {
        &self.store
    }

    /// Starts a turn, continuing from the current document when there is one.
    pub async fn start_iteration(&self, instruction: &str) -> Result<GenerationStream, AppError> {
        let prior = self.store.current_prompt_context().await;
        self.text.start(instruction, prior)
    }

    /// Extracts and commits a finished generation.
    pub async fn complete_iteration(&self, result: &GenerationResult) -> Result<usize, AppError> {
        let document = extract_document(&result.text)?;
        self.store.commit(document).await
    }

    /// One full cycle: generate, extract, commit. Partial output from a failed
    /// cycle is dropped.
    pub async fn run_iteration(&self, instruction: &str) -> Result<IterationResponse, AppError> {
        let result = self.start_iteration(instruction).await?.finish().await?;
        let version = self.complete_iteration(&result).await?;
        let length = self
            .store
            .current()
            .await
            .map(|v| v.document.html.len())
            .unwrap_or_default();

        info!("Iteration committed as version {version} in {}ms", result.elapsed_ms);
        Ok(IterationResponse {
            version,
            elapsed_ms: result.elapsed_ms,
            length,
        })
    }

    pub async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage, AppError> {
        self.image.generate(request).await
    }

    pub fn new_voice_session(&self) -> ConversationSession {
        if self.voice_agent_id.is_none() {
            warn!("No voice agent configured; voice sessions will fail to start");
        }
        ConversationSession::new(Arc::clone(&self.voice), self.voice_agent_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageSettings, TextSettings};
    use crate::session::text::tests::ScriptedProvider;

    fn service_with(provider: Arc<ScriptedProvider>) -> GameService {
        GameService::new(
            TextGenerationSession::new(provider, TextSettings::default()),
            ImageGenerationSession::new(
                Arc::new(FalRealtimeConnector::new(&ImageSettings::default())),
                ImageSettings::default(),
            ),
            Arc::new(ElevenLabsTransport::new(&Default::default())),
            None,
        )
    }

    fn document(body: &str) -> String {
        format!(
            "<!DOCTYPE html><html><body>{body}<script type=\"module\">{}</script></body></html>",
            "let score = 0;".repeat(8)
        )
    }

    #[tokio::test]
    async fn successful_iteration_commits_extracted_document() {
        let doc = document("v1");
        let raw = format!("Here you go:\n```html\n{doc}\n```");
        let service = service_with(ScriptedProvider::with_chunks(&[&raw]));

        let response = service.run_iteration("make a platformer").await.unwrap();
        assert_eq!(response.version, 1);
        assert_eq!(response.length, doc.len());
        assert_eq!(service.store().current_prompt_context().await, Some(doc));
    }

    #[tokio::test]
    async fn prose_only_answer_leaves_store_untouched() {
        let service = service_with(ScriptedProvider::with_chunks(&["Sorry, ", "I can't."]));

        let err = service.run_iteration("make a platformer").await.unwrap_err();
        assert_eq!(err.kind(), "extraction_error");
        assert!(service.store().current().await.is_none());
    }

    #[tokio::test]
    async fn second_iteration_feeds_back_prior_document() {
        let provider = ScriptedProvider::with_chunks(&[]);
        let service = service_with(Arc::clone(&provider));
        let v1 = extract_document(&document("v1")).unwrap();
        service.store().commit(v1.clone()).await.unwrap();

        // The scripted stream is empty, so the turn itself fails extraction.
        let err = service.run_iteration("make it harder").await.unwrap_err();
        assert_eq!(err.kind(), "extraction_error");

        let requests = provider.requests.lock().unwrap();
        assert!(requests[0].messages[1].content.contains(&v1.html));
    }

    #[tokio::test]
    async fn voice_sessions_without_agent_fail_to_start() {
        let service = service_with(ScriptedProvider::with_chunks(&[]));
        let session = service.new_voice_session();
        assert!(session.start_session().await.unwrap_err().is_provider_unavailable());
        assert!(!session.end_session().await);
    }
}
