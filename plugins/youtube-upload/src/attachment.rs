//! Attachments and the workflow around them: upload, retry, cancel, metadata edits, and the
//! status checks that follow an upload.

use crate::config::Settings;
use crate::error::UploadError;
use crate::metadata::{AttachmentMetadata, MetadataProvider, VideoMetadata, update_remote};
use crate::poller::{PollDecision, StatusPoller, StopReason};
use crate::store::{AttachmentId, ErrorRecord, ItemState, Store};
use crate::upload::{CancelSignal, ResumableUpload, UploadTransport};
use crate::youtube_api::{Thumbnail, Video, VideoService};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Smallest thumbnail size handed out when the caller does not ask for one.
pub const DEFAULT_THUMBNAIL_SIZE: (u32, u32) = (120, 90);

/// A local media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub path: PathBuf,
    pub mime_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl Attachment {
    /// An attachment for `path` with the MIME type guessed from its extension and the file
    /// name as title.
    pub fn from_path(id: AttachmentId, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut attachment = Self {
            id,
            mime_type: guess_mime_type(&path).to_string(),
            path,
            title: String::new(),
            description: String::new(),
        };
        attachment.title = attachment.file_stem();
        attachment
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    pub fn file_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" | "qt" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "mpeg" | "mpg" => "video/mpeg",
        "3gp" => "video/3gpp",
        "ogv" => "video/ogg",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// URL of the embeddable player for `video_id`, without related videos from other channels.
pub fn embed_url(video_id: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("rel", "0")
        .append_pair("modestbranding", "0")
        .finish();
    format!("https://www.youtube.com/embed/{video_id}?{query}")
}

/// Runs the attachment workflow against YouTube and keeps [`ItemState`] up to date.
///
/// At most one upload per attachment runs at a time. The uploader tracks the uploads it is
/// running itself; a persisted in-progress flag that none of them owns was left behind by a
/// process that died mid-upload, and the next upload takes it over and resumes the kept
/// session. Independent attachments can be uploaded concurrently from separate tasks.
#[derive(Debug)]
pub struct AttachmentUploader<C, S, P = AttachmentMetadata> {
    client: Arc<C>,
    store: Arc<S>,
    settings: Settings,
    metadata: P,
    running: Mutex<HashSet<AttachmentId>>,
}

/// An upload owned by this process, released on drop.
struct RunningUpload<'a> {
    running: &'a Mutex<HashSet<AttachmentId>>,
    id: AttachmentId,
}

impl Drop for RunningUpload<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.id);
    }
}

fn lock(running: &Mutex<HashSet<AttachmentId>>) -> MutexGuard<'_, HashSet<AttachmentId>> {
    // the set stays consistent even if a holder panicked
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C, S, P> AttachmentUploader<C, S, P>
where
    C: UploadTransport + VideoService,
    S: Store,
    P: MetadataProvider,
{
    pub fn new(client: Arc<C>, store: Arc<S>, settings: Settings, metadata: P) -> Self {
        Self {
            client,
            store,
            settings,
            metadata,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// The metadata to send for `attachment`, given what was sent for it before.
    pub fn metadata_for(
        &self,
        attachment: &Attachment,
        previous: Option<&VideoMetadata>,
    ) -> VideoMetadata {
        self.metadata.metadata(attachment, &self.settings, previous)
    }

    fn claim_locally(&self, id: AttachmentId) -> Option<RunningUpload<'_>> {
        if !lock(&self.running).insert(id) {
            return None;
        }
        Some(RunningUpload {
            running: &self.running,
            id,
        })
    }

    pub async fn should_upload(&self, attachment: &Attachment) -> Result<bool, UploadError> {
        let item = self.store.item(attachment.id).await?;
        Ok(attachment.is_video() && !item.is_uploaded() && !item.in_progress)
    }

    pub async fn is_uploaded(&self, id: AttachmentId) -> Result<bool, UploadError> {
        Ok(self.store.item(id).await?.is_uploaded())
    }

    pub async fn is_processed(&self, id: AttachmentId) -> Result<bool, UploadError> {
        Ok(self.store.item(id).await?.is_processed())
    }

    /// Uploads `attachment`, continuing a previously interrupted session if one was kept.
    ///
    /// Fails with [`UploadError::AlreadyUploading`] while this uploader is already uploading
    /// the attachment.
    #[instrument(skip_all, fields(attachment = attachment.id))]
    pub async fn upload(
        &self,
        attachment: &Attachment,
        cancel: CancelSignal,
    ) -> Result<Video, UploadError> {
        if !attachment.is_video() {
            return Err(UploadError::Local(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a video ({})", attachment.path.display(), attachment.mime_type),
            )));
        }

        let Some(_running) = self.claim_locally(attachment.id) else {
            tracing::warn!("upload already in progress");
            return Err(UploadError::AlreadyUploading(attachment.id));
        };

        let record = attachment.clone();
        let stale = self
            .store
            .update_item(attachment.id, move |item| {
                let stale = item.in_progress;
                item.in_progress = true;
                item.attachment = Some(record);
                stale
            })
            .await?;
        if stale {
            tracing::warn!("taking over an upload left unfinished by an earlier process");
        }

        let result = self.transfer(attachment, cancel).await;
        self.finish(attachment, result).await
    }

    /// Retries the upload of a previously submitted attachment.
    ///
    /// Returns `Ok(None)` if the attachment is already on YouTube.
    #[instrument(skip(self, cancel))]
    pub async fn retry(
        &self,
        id: AttachmentId,
        cancel: CancelSignal,
    ) -> Result<Option<Video>, UploadError> {
        let item = self.store.item(id).await?;
        if item.is_uploaded() {
            tracing::info!("attachment is already uploaded, nothing to retry");
            return Ok(None);
        }
        let Some(attachment) = item.attachment else {
            return Err(UploadError::Config(format!(
                "attachment {id} was never submitted for upload"
            )));
        };
        self.upload(&attachment, cancel).await.map(Some)
    }

    async fn transfer(
        &self,
        attachment: &Attachment,
        cancel: CancelSignal,
    ) -> Result<Video, UploadError> {
        let file = tokio::fs::File::open(&attachment.path).await?;
        let size = file.metadata().await?.len();
        let engine = ResumableUpload::new(self.client.clone(), self.store.clone(), &self.settings);

        let item = self.store.item(attachment.id).await?;
        if let Some(session) = item.session.filter(|s| s.is_resumable()) {
            if session.total_size != size {
                return Err(UploadError::Integrity(format!(
                    "{} is {size} bytes but the interrupted upload declared {}",
                    attachment.path.display(),
                    session.total_size
                )));
            }
            tracing::info!(
                bytes_sent = session.bytes_sent,
                total_size = session.total_size,
                "resuming interrupted upload"
            );
            return engine.resume(file, session, cancel).await;
        }

        let metadata = self.metadata_for(attachment, item.metadata.as_ref());
        let sent = metadata.clone();
        self.store
            .update_item(attachment.id, move |item| item.metadata = Some(sent))
            .await?;
        tracing::info!(size, title = metadata.title, "starting upload");
        engine
            .upload(
                attachment.id,
                file,
                size,
                &attachment.mime_type,
                &metadata.to_insert_request(),
                cancel,
            )
            .await
    }

    /// Records the outcome of a transfer and clears the in-progress flag either way.
    async fn finish(
        &self,
        attachment: &Attachment,
        result: Result<Video, UploadError>,
    ) -> Result<Video, UploadError> {
        let video = match result {
            Ok(video) => video,
            Err(e) => {
                let record = ErrorRecord::from(&e);
                self.store
                    .update_item(attachment.id, move |item| {
                        item.in_progress = false;
                        item.last_error = Some(record);
                    })
                    .await?;
                return Err(e);
            }
        };

        let poll = self
            .settings
            .poll
            .first_check(attachment.id, video.id.clone(), Timestamp::now());
        let stored = video.clone();
        let current = self
            .store
            .update_item(attachment.id, move |item| {
                item.upload_id = Some(stored.id);
                item.snippet = stored.snippet;
                item.status = stored.status;
                item.in_progress = false;
                item.last_error = None;
                item.session = None;
                item.poll = Some(poll);
                (item.attachment.clone(), item.metadata.clone())
            })
            .await?;
        tracing::info!(video_id = video.id, "attachment uploaded");

        // fields edited while the bytes were in flight only reach YouTube this way
        let (latest, previous) = current;
        let latest = latest.unwrap_or_else(|| attachment.clone());
        let metadata = self.metadata_for(&latest, previous.as_ref());
        match update_remote(&*self.client, &video.id, &metadata).await {
            Ok(_) => self.record_metadata(attachment.id, metadata).await?,
            Err(e) => {
                tracing::warn!(error = %e, "could not push metadata after upload");
                self.record_error(attachment.id, &e).await?;
            }
        }
        Ok(video)
    }

    async fn record_metadata(
        &self,
        id: AttachmentId,
        metadata: VideoMetadata,
    ) -> Result<(), UploadError> {
        self.store
            .update_item(id, move |item| item.metadata = Some(metadata))
            .await?;
        Ok(())
    }

    async fn record_error(&self, id: AttachmentId, e: &UploadError) -> Result<(), UploadError> {
        let record = ErrorRecord::from(e);
        self.store
            .update_item(id, move |item| item.last_error = Some(record))
            .await?;
        Ok(())
    }

    /// Abandons any unfinished upload of `id`: releases the remote session, discards the
    /// checkpoint and clears the in-progress flag.
    ///
    /// Returns whether there was anything to cancel. An upload running in this process is
    /// cancelled through its [`CancelHandle`](crate::upload::CancelHandle) instead.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: AttachmentId) -> Result<bool, UploadError> {
        let item = self.store.item(id).await?;
        let uri = item.session.as_ref().and_then(|s| s.session_uri.clone());
        if let Some(uri) = &uri {
            if let Err(e) = self.client.cancel_session(uri).await {
                tracing::warn!(error = %e, "could not release upload session");
            }
        }
        let had_work = uri.is_some() || item.in_progress;
        self.store
            .update_item(id, |item| {
                item.session = None;
                item.in_progress = false;
            })
            .await?;
        Ok(had_work)
    }

    /// Pushes the current metadata of an uploaded attachment to YouTube.
    ///
    /// Returns `Ok(false)` if the attachment is not uploaded.
    #[instrument(skip_all, fields(attachment = attachment.id))]
    pub async fn update(&self, attachment: &Attachment) -> Result<bool, UploadError> {
        let item = self.store.item(attachment.id).await?;
        let Some(video_id) = item.upload_id else {
            return Ok(false);
        };
        let record = attachment.clone();
        self.store
            .update_item(attachment.id, move |item| item.attachment = Some(record))
            .await?;

        let metadata = self.metadata_for(attachment, item.metadata.as_ref());
        match update_remote(&*self.client, &video_id, &metadata).await {
            Ok(updated) => {
                self.record_metadata(attachment.id, metadata).await?;
                Ok(updated)
            }
            Err(e) => {
                tracing::warn!(video_id, error = %e, "could not update video");
                self.record_error(attachment.id, &e).await?;
                Err(e)
            }
        }
    }

    /// Fetches snippet and status of the uploaded video and caches them.
    ///
    /// Returns `Ok(None)` if the attachment is not uploaded.
    #[instrument(skip(self))]
    pub async fn refresh_upload_data(&self, id: AttachmentId) -> Result<Option<Video>, UploadError> {
        let Some(video_id) = self.store.item(id).await?.upload_id else {
            return Ok(None);
        };
        let video = match StatusPoller::new(&*self.client).poll(&video_id).await {
            Ok(video) => video,
            Err(e) => {
                if !e.is_retryable() {
                    self.record_error(id, &e).await?;
                }
                return Err(e);
            }
        };
        let stored = video.clone();
        self.store
            .update_item(id, move |item| {
                item.snippet = stored.snippet;
                item.status = stored.status;
            })
            .await?;
        Ok(Some(video))
    }

    /// Runs the persisted status-check schedule of `id` until it stops.
    ///
    /// Returns `Ok(None)` if nothing was scheduled.
    #[instrument(skip(self))]
    pub async fn run_status_checks(&self, id: AttachmentId) -> Result<Option<StopReason>, UploadError> {
        let policy = self.settings.poll;
        loop {
            let Some(state) = self.store.item(id).await?.poll else {
                return Ok(None);
            };

            let wait = Timestamp::now().duration_until(state.next_check_at);
            let wait = Duration::try_from(wait).unwrap_or(Duration::ZERO);
            tracing::debug!(checks = state.checks, ?wait, "waiting for next status check");
            tokio::time::sleep_until(tokio::time::Instant::now() + wait).await;

            let status = match self.refresh_upload_data(id).await {
                Ok(Some(video)) => video.upload_status(),
                Ok(None) => {
                    self.store.update_item(id, |item| item.poll = None).await?;
                    return Ok(None);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = %e, "status check failed, counting it as inconclusive");
                    None
                }
                Err(e) => {
                    self.store.update_item(id, |item| item.poll = None).await?;
                    return Err(e);
                }
            };

            match policy.decide(&state, status, Timestamp::now()) {
                PollDecision::Reschedule(next) => {
                    self.store
                        .update_item(id, move |item| item.poll = Some(next))
                        .await?;
                }
                PollDecision::Stop(reason) => {
                    tracing::info!(?reason, "status checks finished");
                    self.store.update_item(id, |item| item.poll = None).await?;
                    return Ok(Some(reason));
                }
            }
        }
    }

    /// Restarts every persisted status-check schedule, one task per attachment.
    pub async fn resume_pending_polls(
        self: &Arc<Self>,
    ) -> Result<Vec<JoinHandle<Result<Option<StopReason>, UploadError>>>, UploadError>
    where
        C: 'static,
        S: 'static,
        P: 'static,
    {
        let pending = self.store.items_with_pending_polls().await?;
        tracing::info!(count = pending.len(), "resuming pending status checks");
        Ok(pending
            .into_iter()
            .map(|state| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_status_checks(state.attachment).await })
            })
            .collect())
    }

    pub async fn item(&self, id: AttachmentId) -> Result<ItemState, UploadError> {
        Ok(self.store.item(id).await?)
    }

    pub async fn embed_url(&self, id: AttachmentId) -> Result<Option<String>, UploadError> {
        Ok(self.store.item(id).await?.upload_id.as_deref().map(embed_url))
    }

    /// The smallest cached thumbnail covering `min_width` x `min_height`, or the largest one.
    pub async fn thumbnail(
        &self,
        id: AttachmentId,
        min_width: u32,
        min_height: u32,
    ) -> Result<Option<Thumbnail>, UploadError> {
        let item = self.store.item(id).await?;
        Ok(item
            .snippet
            .as_ref()
            .and_then(|s| s.thumbnails.as_ref())
            .and_then(|t| t.best_fit(min_width, min_height))
            .cloned())
    }
}
