//! Typed persistence for credentials and per-attachment upload state.
//!
//! [`Store`] is the repository interface the rest of the crate talks to. [`FileStore`] keeps
//! everything in one JSON document that is rewritten atomically (temp file + rename) on every
//! mutation, or only in memory for tests.

use crate::attachment::Attachment;
use crate::error::{ErrorKind, StoreError, UploadError};
use crate::metadata::VideoMetadata;
use crate::poller::PollState;
use crate::upload::UploadSession;
use crate::youtube_api::{UploadStatus, VideoSnippet, VideoStatus};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Local identifier of an attachment (the media item being uploaded).
pub type AttachmentId = u64;

/// The persisted form of the OAuth credential's tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Timestamp,
}

/// The last fatal error seen for an attachment, kept for operator visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: Timestamp,
}

impl From<&UploadError> for ErrorRecord {
    fn from(e: &UploadError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            at: Timestamp::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    /// The attachment as last submitted, so retries and status checks can find its file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// What was last sent to YouTube for this attachment, including tags, category and privacy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VideoMetadata>,
    /// Remote video id, set once an upload completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<VideoSnippet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VideoStatus>,
    #[serde(default)]
    pub in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorRecord>,
    /// Open or failed resumable session, present only while an upload is unfinished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<UploadSession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollState>,
}

impl ItemState {
    pub fn is_uploaded(&self) -> bool {
        self.upload_id.is_some()
    }

    pub fn is_processed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.upload_status == UploadStatus::Processed)
    }
}

/// Repository interface for everything the uploader persists.
pub trait Store: Send + Sync {
    fn load_token(&self) -> impl Future<Output = Result<Option<StoredToken>, StoreError>> + Send;

    fn save_token(&self, token: &StoredToken)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns the state of `id`, or an empty state if nothing was recorded yet.
    fn item(&self, id: AttachmentId) -> impl Future<Output = Result<ItemState, StoreError>> + Send;

    /// Atomically applies `f` to the state of `id` and persists the result.
    fn update_item<F, T>(
        &self,
        id: AttachmentId,
        f: F,
    ) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        F: FnOnce(&mut ItemState) -> T + Send,
        T: Send;

    /// All attachments with a scheduled status check.
    fn items_with_pending_polls(&self) -> impl Future<Output = Result<Vec<PollState>, StoreError>> + Send;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    token: Option<StoredToken>,
    #[serde(default)]
    items: BTreeMap<AttachmentId, ItemState>,
}

#[derive(Debug, Default)]
pub struct FileStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
}

impl FileStore {
    /// Opens the state file at `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::default()
    }

    async fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(data).map_err(StoreError::Serialize)?;
        let tmp = path.with_extension("tmp");
        let write = async {
            tokio::fs::write(&tmp, &json).await?;
            tokio::fs::rename(&tmp, path).await
        };
        write.await.map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })
    }
}

impl Store for FileStore {
    async fn load_token(&self) -> Result<Option<StoredToken>, StoreError> {
        Ok(self.data.lock().await.token.clone())
    }

    async fn save_token(&self, token: &StoredToken) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        let previous = data.token.replace(token.clone());
        if let Err(e) = self.persist(&data).await {
            data.token = previous;
            return Err(e);
        }
        Ok(())
    }

    async fn item(&self, id: AttachmentId) -> Result<ItemState, StoreError> {
        Ok(self
            .data
            .lock()
            .await
            .items
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_item<F, T>(&self, id: AttachmentId, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut ItemState) -> T + Send,
        T: Send,
    {
        let mut data = self.data.lock().await;
        let mut item = data.items.get(&id).cloned().unwrap_or_default();
        let out = f(&mut item);
        let previous = data.items.insert(id, item);
        if let Err(e) = self.persist(&data).await {
            match previous {
                Some(previous) => data.items.insert(id, previous),
                None => data.items.remove(&id),
            };
            return Err(e);
        }
        Ok(out)
    }

    async fn items_with_pending_polls(&self) -> Result<Vec<PollState>, StoreError> {
        Ok(self
            .data
            .lock()
            .await
            .items
            .values()
            .filter_map(|item| item.poll.clone())
            .collect())
    }
}
