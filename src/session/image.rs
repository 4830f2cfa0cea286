use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ImageSettings;
use crate::errors::AppError;
use crate::models::{GeneratedImage, ImageRequest};
use crate::provider::image::{
    FalImageInput, ImageSize, RealtimeConnection, RealtimeEvent, RealtimeImageConnector,
};

const PROMPT_SUFFIX: &str = " beautiful award-winning professional";
const FALLBACK_PROMPT: &str = "a random image, such as a cat, a tree, or a house";
const NEGATIVE_PROMPT: &str = "amateur, low quality";

/// Sketch + hint -> one generated image, over a fresh realtime connection per
/// call, bounded by a hard timeout.
pub struct ImageGenerationSession {
    connector: Arc<dyn RealtimeImageConnector>,
    settings: ImageSettings,
}

impl ImageGenerationSession {
    pub fn new(connector: Arc<dyn RealtimeImageConnector>, settings: ImageSettings) -> Self {
        Self { connector, settings }
    }

    pub async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage, AppError> {
        if request.sketch.trim().is_empty() {
            return Err(AppError::invalid_input("sketch image cannot be empty"));
        }
        let input = build_input(request, self.settings.image_size);

        let mut handle = ImageSessionHandle::arm(Uuid::new_v4(), self.settings.timeout);
        info!(
            "Sending image generation request {} (size {}, hint: {:?})",
            handle.id, input.image_size.width, request.text_hint
        );

        let outcome = handle.run(self.connector.as_ref(), &input).await;
        handle.cleanup().await;

        match &outcome {
            Ok(_) => info!("Image generation {} resolved", handle.id),
            Err(e) => error!("Image generation {} failed: {e}", handle.id),
        }
        outcome
    }
}

/// Applies the fixed prompt shaping and tuning to a user request.
pub fn build_input(request: &ImageRequest, default_size: u32) -> FalImageInput {
    let hint = request.text_hint.trim();
    let prompt = if hint.is_empty() {
        format!("{FALLBACK_PROMPT}{PROMPT_SUFFIX}")
    } else {
        format!("{hint}{PROMPT_SUFFIX}")
    };
    let size = request.image_size.unwrap_or(default_size);

    FalImageInput {
        prompt,
        negative_prompt: NEGATIVE_PROMPT.to_string(),
        image_url: request.sketch.clone(),
        image_size: ImageSize { width: size, height: size },
        num_images: 1,
        sync_mode: true,
        expand_prompt: true,
        num_inference_steps: 4,
        guidance_scale: 1.98,
        strength: 0.748,
        seed: 42,
    }
}

/// State of one in-flight image request.
///
/// `closed` is a one-way latch: once set, nothing is sent and no result is
/// honored, and further `cleanup` calls do nothing.
pub struct ImageSessionHandle {
    id: Uuid,
    timeout: Duration,
    connection: Option<Box<dyn RealtimeConnection>>,
    timer: Option<Pin<Box<Sleep>>>,
    closed: bool,
}

impl ImageSessionHandle {
    /// Creates the handle with its timer already running.
    pub fn arm(id: Uuid, timeout: Duration) -> Self {
        Self {
            id,
            timeout,
            connection: None,
            timer: Some(Box::pin(sleep(timeout))),
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Connect, send, await the single result; whichever comes first between
    /// that and the timer wins.
    pub async fn run(
        &mut self,
        connector: &dyn RealtimeImageConnector,
        input: &FalImageInput,
    ) -> Result<GeneratedImage, AppError> {
        if self.closed {
            return Err(AppError::connection("image session already closed"));
        }
        let after_ms = self.timeout.as_millis() as u64;
        let id = self.id;
        let Self { connection, timer, .. } = self;
        let Some(timer) = timer.as_mut() else {
            return Err(AppError::Unexpected("image session timer missing".into()));
        };

        tokio::select! {
            _ = timer => {
                warn!("Image generation {id} timed out after {after_ms}ms");
                Err(AppError::Timeout { after_ms })
            }
            outcome = exchange(connector, connection, id, input) => outcome,
        }
    }

    /// Cancels the timer and closes the connection, once. Returns whether
    /// this call did the work.
    pub async fn cleanup(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.timer = None;
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!("Error during connection cleanup for {}: {e}", self.id);
            }
        }
        debug!("Image session {} cleaned up", self.id);
        true
    }
}

impl Drop for ImageSessionHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        warn!("Image session {} dropped without cleanup, closing in background", self.id);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = connection.close().await {
                        warn!("Error during connection cleanup for {id}: {e}");
                    }
                });
            }
            Err(_) => warn!("No runtime to close connection for {id}"),
        }
    }
}

async fn exchange(
    connector: &dyn RealtimeImageConnector,
    slot: &mut Option<Box<dyn RealtimeConnection>>,
    id: Uuid,
    input: &FalImageInput,
) -> Result<GeneratedImage, AppError> {
    let connection = slot.insert(connector.connect(&id.to_string()).await?);
    connection.send(input).await?;

    match connection.next_event().await {
        Some(RealtimeEvent::Result(output)) => output
            .images
            .first()
            .and_then(|image| image.to_url())
            .map(|url| GeneratedImage { url })
            .ok_or_else(|| {
                warn!("Received empty result for {id}");
                AppError::EmptyResult
            }),
        Some(RealtimeEvent::Error(message)) => Err(AppError::connection(message)),
        None => Err(AppError::connection("connection closed before a result arrived")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_bytes::ByteBuf;

    use super::*;
    use crate::provider::image::{FalImage, FalImageOutput, ImageContent};

    #[derive(Clone)]
    enum Reply {
        Event(RealtimeEvent),
        Silence,
    }

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        sends: AtomicUsize,
        closes: AtomicUsize,
        inputs: Mutex<Vec<FalImageInput>>,
    }

    struct FakeConnector {
        reply: Reply,
        counters: Arc<Counters>,
    }

    struct FakeConnection {
        reply: Reply,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl RealtimeImageConnector for FakeConnector {
        async fn connect(&self, _key: &str) -> Result<Box<dyn RealtimeConnection>, AppError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                reply: self.reply.clone(),
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    #[async_trait]
    impl RealtimeConnection for FakeConnection {
        async fn send(&mut self, input: &FalImageInput) -> Result<(), AppError> {
            self.counters.sends.fetch_add(1, Ordering::SeqCst);
            self.counters.inputs.lock().unwrap().push(input.clone());
            Ok(())
        }

        async fn next_event(&mut self) -> Option<RealtimeEvent> {
            match &self.reply {
                Reply::Event(event) => Some(event.clone()),
                Reply::Silence => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), AppError> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session(reply: Reply) -> (ImageGenerationSession, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let connector = FakeConnector { reply, counters: Arc::clone(&counters) };
        (
            ImageGenerationSession::new(Arc::new(connector), ImageSettings::default()),
            counters,
        )
    }

    fn request(hint: &str) -> ImageRequest {
        ImageRequest::from_png(&[1, 2, 3], hint)
    }

    #[tokio::test]
    async fn result_bytes_come_back_as_data_uri() {
        let output = FalImageOutput {
            images: vec![FalImage {
                content: Some(ImageContent::Bytes(ByteBuf::from(vec![137, 80, 78, 71]))),
                content_type: Some("image/png".into()),
            }],
            request_id: None,
        };
        let (session, counters) = session(Reply::Event(RealtimeEvent::Result(output)));

        let image = session.generate(&request("a castle")).await.unwrap();
        assert_eq!(image.url, "data:image/png;base64,iVBORw==");
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.sends.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_image_list_is_an_error_not_a_null_success() {
        let output = FalImageOutput { images: vec![], request_id: None };
        let (session, counters) = session(Reply::Event(RealtimeEvent::Result(output)));

        let err = session.generate(&request("")).await.unwrap_err();
        assert!(matches!(err, AppError::EmptyResult));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_error_event_still_closes_connection() {
        let (session, counters) =
            session(Reply::Event(RealtimeEvent::Error("bad input".into())));

        let err = session.generate(&request("x")).await.unwrap_err();
        assert_eq!(err.kind(), "connection_error");
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_releases_everything() {
        let (session, counters) = session(Reply::Silence);

        let err = session.generate(&request("x")).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout { after_ms: 10_000 }));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_is_idempotent() {
        let counters = Arc::new(Counters::default());
        let connector = FakeConnector { reply: Reply::Silence, counters: Arc::clone(&counters) };
        let mut handle = ImageSessionHandle::arm(Uuid::new_v4(), Duration::from_millis(50));
        let input = build_input(&request("x"), 512);

        let err = handle.run(&connector, &input).await.unwrap_err();
        assert!(err.is_timeout());

        assert!(handle.cleanup().await);
        assert!(!handle.cleanup().await);
        assert!(handle.is_closed());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        // Closed sessions refuse further work.
        let err = handle.run(&connector, &input).await.unwrap_err();
        assert_eq!(err.kind(), "connection_error");
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_still_closes_its_connection() {
        let (session, counters) = session(Reply::Silence);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), session.generate(&request("x"))).await;
        assert!(abandoned.is_err());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);

        for _ in 0..10 {
            if counters.closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prompt_shaping_matches_provider_tuning() {
        let input = build_input(&request("a dragon"), 512);
        assert_eq!(input.prompt, "a dragon beautiful award-winning professional");
        assert_eq!(input.negative_prompt, "amateur, low quality");
        assert_eq!(input.image_size, ImageSize { width: 512, height: 512 });
        assert_eq!(input.num_images, 1);
        assert!(input.sync_mode);
        assert!(input.image_url.starts_with("data:image/png;base64,"));

        let fallback = build_input(&request("   "), 256);
        assert!(fallback.prompt.starts_with("a random image"));
        assert_eq!(fallback.image_size.width, 256);
    }

    #[tokio::test]
    async fn blank_sketch_is_rejected_before_connecting() {
        let (session, counters) = session(Reply::Silence);
        let req = ImageRequest { sketch: " ".into(), text_hint: String::new(), image_size: None };
        let err = session.generate(&req).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }
}
