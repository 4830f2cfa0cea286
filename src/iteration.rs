use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::errors::AppError;
use crate::models::{DocumentVersion, ExtractedDocument, VersionSummary};

/// Authoritative "current game" shared across turns.
///
/// History is append-only and only ever holds valid documents; the current
/// version is the last element. Consumers share one store behind an `Arc`
/// rather than keeping their own copies.
pub struct IterationStore {
    versions: RwLock<Vec<DocumentVersion>>,
    current_version: watch::Sender<usize>,
}

impl Default for IterationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IterationStore {
    pub fn new() -> Self {
        let (current_version, _) = watch::channel(0);
        Self {
            versions: RwLock::new(Vec::new()),
            current_version,
        }
    }

    /// Appends `doc` and makes it current. Returns its 1-based version number.
    pub async fn commit(&self, doc: ExtractedDocument) -> Result<usize, AppError> {
        if !doc.is_valid {
            return Err(AppError::ExtractionError {
                length: doc.html.trim().len(),
                minimum: crate::extraction::MIN_DOCUMENT_LENGTH,
            });
        }

        let mut versions = self.versions.write().await;
        let version = versions.len() + 1;
        info!("Committing document version {version} ({} bytes)", doc.html.len());
        versions.push(DocumentVersion {
            version,
            document: doc,
            committed_at: Utc::now(),
        });
        drop(versions);

        self.current_version.send_replace(version);
        Ok(version)
    }

    pub async fn current(&self) -> Option<DocumentVersion> {
        self.versions.read().await.last().cloned()
    }

    /// The current document's html, for embedding in the next request.
    pub async fn current_prompt_context(&self) -> Option<String> {
        self.versions
            .read()
            .await
            .last()
            .map(|v| v.document.html.clone())
    }

    pub async fn version(&self, version: usize) -> Option<DocumentVersion> {
        let versions = self.versions.read().await;
        version
            .checked_sub(1)
            .and_then(|idx| versions.get(idx))
            .cloned()
    }

    pub async fn history(&self) -> Vec<VersionSummary> {
        self.versions
            .read()
            .await
            .iter()
            .map(VersionSummary::from)
            .collect()
    }

    /// Yields the current version number (0 before the first commit) and
    /// changes on every commit.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.current_version.subscribe()
    }
}
