use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::TextSettings;
use crate::errors::AppError;
use crate::models::{GenerationRequest, GenerationResult, StreamState};
use crate::prompt::compose_messages;
use crate::provider::text::{ChatCompletionRequest, TextCompletionProvider};

const EVENT_BUFFER: usize = 64;

#[derive(Debug)]
pub enum GenerationEvent {
    /// One provider chunk, in arrival order.
    Partial(String),
    Completed(GenerationResult),
    Failed(AppError),
}

/// Drives one code-generation call per user turn.
///
/// A session runs at most one call at a time: `start` while a call is in
/// flight is rejected with [`AppError::AlreadyInProgress`]. The accumulated
/// text is published through [`TextGenerationSession::subscribe`] after every
/// chunk.
pub struct TextGenerationSession {
    provider: Arc<dyn TextCompletionProvider>,
    settings: TextSettings,
    in_flight: Arc<AtomicBool>,
    state: Arc<watch::Sender<StreamState>>,
}

impl TextGenerationSession {
    pub fn new(provider: Arc<dyn TextCompletionProvider>, settings: TextSettings) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            provider,
            settings,
            in_flight: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Starts one generation call. Empty instructions fail without contacting
    /// the provider.
    pub fn start(
        &self,
        instruction: &str,
        prior_document: Option<String>,
    ) -> Result<GenerationStream, AppError> {
        let request = GenerationRequest::new(instruction, prior_document)?;
        let guard = InFlightGuard::acquire(&self.in_flight, &self.state)?;

        let id = Uuid::new_v4();
        let completion = ChatCompletionRequest {
            model: self.settings.model.clone(),
            messages: compose_messages(&request),
            stream: true,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };
        info!(
            "Sending code generation request {id} (model {}, continuation: {})",
            completion.model,
            request.prior_document.is_some()
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let provider = Arc::clone(&self.provider);
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(drive(provider, completion, id, state, tx, guard));

        Ok(GenerationStream { id, events: rx, task })
    }
}

async fn drive(
    provider: Arc<dyn TextCompletionProvider>,
    request: ChatCompletionRequest,
    id: Uuid,
    state: Arc<watch::Sender<StreamState>>,
    tx: mpsc::Sender<GenerationEvent>,
    guard: InFlightGuard,
) {
    let started = Instant::now();
    state.send_replace(StreamState::Streaming(String::new()));

    let mut stream = match provider.open_stream(&request).await {
        Ok(stream) => stream,
        Err(e) => return fail(id, e, &state, &tx, guard).await,
    };

    let mut accumulated = String::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                accumulated.push_str(&chunk);
                state.send_replace(StreamState::Streaming(accumulated.clone()));
                if tx.send(GenerationEvent::Partial(chunk)).await.is_err() {
                    debug!("Consumer of generation {id} went away, abandoning stream");
                    return;
                }
            }
            Err(e) => return fail(id, e, &state, &tx, guard).await,
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        "Code generation {id} complete after {:.1}s ({} bytes)",
        elapsed_ms as f64 / 1000.0,
        accumulated.len()
    );
    state.send_replace(StreamState::Completed(accumulated.clone()));
    // Released before the terminal event so the consumer can start again
    // as soon as it sees it.
    drop(guard);
    let _ = tx
        .send(GenerationEvent::Completed(GenerationResult {
            text: accumulated,
            elapsed_ms,
        }))
        .await;
}

async fn fail(
    id: Uuid,
    e: AppError,
    state: &watch::Sender<StreamState>,
    tx: &mpsc::Sender<GenerationEvent>,
    guard: InFlightGuard,
) {
    error!("Code generation {id} failed: {e}");
    state.send_replace(StreamState::Failed(e.to_string()));
    drop(guard);
    let _ = tx.send(GenerationEvent::Failed(e)).await;
}

/// Handle to one in-flight call. Dropping it cancels the call; no terminal
/// event is produced for a cancelled call.
pub struct GenerationStream {
    id: Uuid,
    events: mpsc::Receiver<GenerationEvent>,
    task: JoinHandle<()>,
}

impl GenerationStream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn next(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    /// Ignores partial updates and waits for the final value.
    pub async fn finish(mut self) -> Result<GenerationResult, AppError> {
        while let Some(event) = self.next().await {
            match event {
                GenerationEvent::Partial(_) => continue,
                GenerationEvent::Completed(result) => return Ok(result),
                GenerationEvent::Failed(e) => return Err(e),
            }
        }
        Err(AppError::Unexpected(format!(
            "generation {} ended without a result",
            self.id
        )))
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Holds the session's single in-flight slot; releases it on every exit path,
/// including task abort.
struct InFlightGuard {
    flag: Arc<AtomicBool>,
    state: Arc<watch::Sender<StreamState>>,
}

impl InFlightGuard {
    fn acquire(
        flag: &Arc<AtomicBool>,
        state: &Arc<watch::Sender<StreamState>>,
    ) -> Result<Self, AppError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AppError::AlreadyInProgress)?;
        Ok(Self {
            flag: Arc::clone(flag),
            state: Arc::clone(state),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.send_if_modified(|s| {
            if s.is_streaming() {
                *s = StreamState::Idle;
                true
            } else {
                false
            }
        });
        self.flag.store(false, Ordering::Release);
    }
}
