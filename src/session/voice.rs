use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::AppError;
use crate::models::{AgentMode, ConnectionStatus, ConversationTurn, Role};
use crate::provider::voice::{VoiceConnection, VoiceEvent, VoiceTransport};

/// Observable state of one voice conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationSnapshot {
    pub status: ConnectionStatus,
    pub mode: AgentMode,
    pub transcript: Vec<ConversationTurn>,
    pub last_error: Option<String>,
}

impl ConversationSnapshot {
    /// Folds one provider event into the snapshot. Turns are kept in arrival
    /// order with the role the provider reported.
    pub fn apply(&mut self, event: VoiceEvent) {
        match event {
            VoiceEvent::Connected => self.status = ConnectionStatus::Connected,
            VoiceEvent::Disconnected => {
                self.status = ConnectionStatus::Disconnected;
                self.mode = AgentMode::Listening;
            }
            VoiceEvent::Error(message) => self.last_error = Some(message),
            VoiceEvent::ModeChange(mode) => {
                if self.status == ConnectionStatus::Connected {
                    self.mode = mode;
                }
            }
            VoiceEvent::Message { text, source } => {
                self.transcript.push(ConversationTurn { role: source, text });
            }
        }
    }

    /// Best-effort game description: the agent's latest proposal, or what the
    /// user said when the agent has not spoken yet.
    pub fn finalize_description(&self) -> Result<String, AppError> {
        let from_agent = self
            .transcript
            .iter()
            .rev()
            .filter(|turn| turn.role == Role::Agent)
            .map(|turn| turn.text.trim())
            .find(|text| !text.is_empty());
        if let Some(text) = from_agent {
            return Ok(text.to_string());
        }

        let from_user = self
            .transcript
            .iter()
            .filter(|turn| turn.role == Role::User)
            .map(|turn| turn.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if from_user.is_empty() {
            return Err(AppError::invalid_input(
                "no game description available, talk to the agent first",
            ));
        }
        Ok(from_user)
    }
}

/// One duplex voice conversation.
///
/// `end_session` is safe from every state, including while the connection is
/// still being established, and releases the connection exactly once.
pub struct ConversationSession {
    transport: Arc<dyn VoiceTransport>,
    agent_id: Option<String>,
    state: Arc<watch::Sender<ConversationSnapshot>>,
    connection: Mutex<Option<Box<dyn VoiceConnection>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    ended: AtomicBool,
}

impl ConversationSession {
    pub fn new(transport: Arc<dyn VoiceTransport>, agent_id: Option<String>) -> Self {
        let (state, _) = watch::channel(ConversationSnapshot::default());
        Self {
            transport,
            agent_id,
            state: Arc::new(state),
            connection: Mutex::new(None),
            pump: StdMutex::new(None),
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.state.borrow().clone()
    }

    pub fn finalize_description(&self) -> Result<String, AppError> {
        self.state.borrow().finalize_description()
    }

    /// Opens the conversation. A session is started at most once.
    pub async fn start_session(&self) -> Result<(), AppError> {
        let agent_id = self
            .agent_id
            .clone()
            .ok_or_else(|| AppError::missing_credentials("voice agent"))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyInProgress);
        }
        if self.ended.load(Ordering::SeqCst) {
            return Err(AppError::connection("voice session already ended"));
        }

        self.state
            .send_modify(|s| s.status = ConnectionStatus::Connecting);

        let (mut connection, events) = match self.transport.start(&agent_id).await {
            Ok(started) => started,
            Err(e) => {
                error!("Failed to start voice conversation: {e}");
                self.state.send_modify(|s| {
                    s.status = ConnectionStatus::Disconnected;
                    s.last_error = Some(e.to_string());
                });
                return Err(e);
            }
        };

        let mut slot = self.connection.lock().await;
        if self.ended.load(Ordering::SeqCst) {
            drop(slot);
            info!("Voice session ended while connecting, closing new connection");
            if let Err(e) = connection.close().await {
                warn!("Error closing voice connection: {e}");
            }
            return Ok(());
        }
        *slot = Some(connection);
        // Registered under the connection lock so end_session always sees it.
        let pump = tokio::spawn(pump_events(events, Arc::clone(&self.state)));
        if let Ok(mut guard) = self.pump.lock() {
            *guard = Some(pump);
        }
        drop(slot);
        Ok(())
    }

    pub async fn send_audio(&self, pcm: &[u8]) -> Result<(), AppError> {
        match self.connection.lock().await.as_mut() {
            Some(connection) => connection.send_audio(pcm).await,
            None => Err(AppError::connection("voice session is not connected")),
        }
    }

    /// Tears the conversation down and discards the transcript. Returns
    /// whether a held connection was released by this call.
    pub async fn end_session(&self) -> bool {
        self.ended.store(true, Ordering::SeqCst);

        let connection = self.connection.lock().await.take();
        if let Ok(mut guard) = self.pump.lock() {
            if let Some(pump) = guard.take() {
                pump.abort();
            }
        }

        let released = match connection {
            Some(mut connection) => {
                if let Err(e) = connection.close().await {
                    warn!("Error closing voice connection: {e}");
                }
                info!("Voice session ended");
                true
            }
            None => false,
        };

        self.state.send_modify(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.mode = AgentMode::Listening;
            s.transcript.clear();
        });
        released
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Ok(guard) = self.pump.get_mut() {
            if let Some(pump) = guard.take() {
                pump.abort();
            }
        }
        if self.connection.get_mut().take().is_some() {
            warn!("Voice session dropped without end_session, connection released on drop");
        }
    }
}

async fn pump_events(
    mut events: mpsc::Receiver<VoiceEvent>,
    state: Arc<watch::Sender<ConversationSnapshot>>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            VoiceEvent::Error(message) => error!("Voice provider error: {message}"),
            VoiceEvent::Message { source, .. } => debug!("Voice message from {source}"),
            other => debug!("Voice event {other:?}"),
        }
        state.send_modify(|s| s.apply(event));
    }
    state.send_modify(|s| s.apply(VoiceEvent::Disconnected));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    struct FakeTransport {
        starts: AtomicUsize,
        closes: Arc<AtomicUsize>,
        audio_bytes: Arc<AtomicUsize>,
        feed: StdMutex<Option<mpsc::Sender<VoiceEvent>>>,
        gate: Option<Arc<Notify>>,
    }

    struct FakeConnection {
        closes: Arc<AtomicUsize>,
        audio_bytes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VoiceConnection for FakeConnection {
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
    impl VoiceTransport for FakeTransport {
        async fn start(
            &self,
            _agent_id: &str,
        ) -> Result<(Box<dyn VoiceConnection>, mpsc::Receiver<VoiceEvent>), AppError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let (tx, rx) = mpsc::channel(16);
            *self.feed.lock().unwrap() = Some(tx);
            let connection = FakeConnection {
                closes: Arc::clone(&self.closes),
                audio_bytes: Arc::clone(&self.audio_bytes),
            };
            Ok((Box::new(connection), rx))
        }
    }

    fn feed(transport: &FakeTransport) -> mpsc::Sender<VoiceEvent> {
        transport.feed.lock().unwrap().clone().unwrap()
    }

    async fn settle(rx: &mut watch::Receiver<ConversationSnapshot>, turns: usize) {
        rx.wait_for(|s| s.transcript.len() >= turns).await.unwrap();
    }

    #[tokio::test]
    async fn transcript_preserves_arrival_order_and_roles() {
        let transport = Arc::new(FakeTransport::default());
        let session = ConversationSession::new(transport.clone(), Some("agent".into()));
        let mut rx = session.subscribe();

        session.start_session().await.unwrap();
        let tx = feed(&transport);
        tx.send(VoiceEvent::Connected).await.unwrap();
        tx.send(VoiceEvent::Message { text: "make it harder".into(), source: Role::User })
            .await
            .unwrap();
        tx.send(VoiceEvent::Message { text: "Adding spikes.".into(), source: Role::Agent })
            .await
            .unwrap();
        settle(&mut rx, 2).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(
            snapshot.transcript,
            vec![
                ConversationTurn { role: Role::User, text: "make it harder".into() },
                ConversationTurn { role: Role::Agent, text: "Adding spikes.".into() },
            ]
        );
        assert_eq!(session.finalize_description().unwrap(), "Adding spikes.");
        assert!(session.end_session().await);
    }

    #[test]
    fn mode_changes_only_apply_while_connected() {
        let mut snapshot = ConversationSnapshot::default();
        snapshot.apply(VoiceEvent::ModeChange(AgentMode::Speaking));
        assert_eq!(snapshot.mode, AgentMode::Listening);

        snapshot.apply(VoiceEvent::Connected);
        snapshot.apply(VoiceEvent::ModeChange(AgentMode::Speaking));
        assert_eq!(snapshot.mode, AgentMode::Speaking);
        snapshot.apply(VoiceEvent::ModeChange(AgentMode::Listening));
        assert_eq!(snapshot.mode, AgentMode::Listening);

        snapshot.apply(VoiceEvent::ModeChange(AgentMode::Speaking));
        snapshot.apply(VoiceEvent::Disconnected);
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert_eq!(snapshot.mode, AgentMode::Listening);
    }

    #[tokio::test]
    async fn end_session_is_safe_when_never_connected_and_idempotent() {
        let transport = Arc::new(FakeTransport::default());
        let session = ConversationSession::new(transport.clone(), Some("agent".into()));
        assert!(!session.end_session().await);

        let session = ConversationSession::new(transport.clone(), Some("agent".into()));
        session.start_session().await.unwrap();
        assert!(session.end_session().await);
        assert!(!session.end_session().await);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.snapshot().status, ConnectionStatus::Disconnected);
        assert!(session.snapshot().transcript.is_empty());
    }

    #[tokio::test]
    async fn end_while_connecting_releases_the_late_connection() {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(FakeTransport { gate: Some(Arc::clone(&gate)), ..Default::default() });
        let session = Arc::new(ConversationSession::new(transport.clone(), Some("agent".into())));

        let starting = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.start_session().await }
        });
        let mut rx = session.subscribe();
        rx.wait_for(|s| s.status == ConnectionStatus::Connecting).await.unwrap();

        assert!(!session.end_session().await);
        gate.notify_one();
        starting.await.unwrap().unwrap();

        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.snapshot().status, ConnectionStatus::Disconnected);
        assert!(session.send_audio(&[0; 4]).await.is_err());
    }

    #[tokio::test]
    async fn audio_is_forwarded_while_connected() {
        let transport = Arc::new(FakeTransport::default());
        let session = ConversationSession::new(transport.clone(), Some("agent".into()));
        assert!(session.send_audio(&[0; 8]).await.is_err());

        session.start_session().await.unwrap();
        session.send_audio(&[0; 8]).await.unwrap();
        assert_eq!(transport.audio_bytes.load(Ordering::SeqCst), 8);
        session.end_session().await;
    }

    #[tokio::test]
    async fn missing_agent_id_is_missing_credentials() {
        let transport = Arc::new(FakeTransport::default());
        let session = ConversationSession::new(transport.clone(), None);
        let err = session.start_session().await.unwrap_err();
        assert!(err.is_provider_unavailable());
        assert_eq!(transport.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn finalize_falls_back_to_user_turns_then_fails() {
        let mut snapshot = ConversationSnapshot::default();
        assert!(snapshot.finalize_description().unwrap_err().is_validation());

        snapshot.apply(VoiceEvent::Message { text: "a platformer".into(), source: Role::User });
        snapshot.apply(VoiceEvent::Message { text: "with gravity flips".into(), source: Role::User });
        assert_eq!(snapshot.finalize_description().unwrap(), "a platformer with gravity flips");

        snapshot.apply(VoiceEvent::Message { text: "Gravity Flip: jump and flip.".into(), source: Role::Agent });
        snapshot.apply(VoiceEvent::Message { text: "  ".into(), source: Role::Agent });
        assert_eq!(snapshot.finalize_description().unwrap(), "Gravity Flip: jump and flip.");
    }
}
