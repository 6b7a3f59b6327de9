//! Resumable Upload Engine.
//!
//! Moves a local byte source to YouTube over the resumable upload protocol: a session is opened
//! once, then the file is streamed in fixed-size chunks. After every acknowledged chunk the
//! [`UploadSession`] is checkpointed to the [`Store`] so that the upload can continue from the
//! last validated offset after a network failure, a quota pause, or a crash.
//!
//! After any retryable failure the engine asks the server how many bytes it actually has
//! before sending anything else. A response that was lost in flight therefore never leads to
//! bytes being sent twice, and an offset the server does not vouch for is never assumed.

use crate::config::Settings;
use crate::error::UploadError;
use crate::store::{AttachmentId, Store};
use crate::youtube_api::{Video, VideoInsertRequest};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::watch;
use tracing::instrument;

/// What is needed to open a resumable session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub total_size: u64,
    pub content_type: String,
    pub body: VideoInsertRequest,
}

/// The server's answer to a chunk or to an offset query.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// `308 Resume Incomplete`; the server holds bytes `0..next_offset`.
    Incomplete { next_offset: u64 },
    /// The last byte arrived and the video resource was created.
    Complete(Video),
}

/// The wire side of the resumable protocol, implemented over HTTP by
/// [`YouTubeClient`](crate::youtube_api::YouTubeClient).
pub trait UploadTransport: Send + Sync {
    /// Opens a session and returns its URI.
    fn open_session(
        &self,
        request: &SessionRequest,
    ) -> impl Future<Output = Result<String, UploadError>> + Send;

    /// Sends `chunk` as bytes `offset..offset + chunk.len()` of `total_size`.
    fn send_chunk(
        &self,
        session_uri: &str,
        offset: u64,
        chunk: Bytes,
        total_size: u64,
    ) -> impl Future<Output = Result<ChunkOutcome, UploadError>> + Send;

    /// Asks how many bytes the server has persisted.
    fn query_offset(
        &self,
        session_uri: &str,
        total_size: u64,
    ) -> impl Future<Output = Result<ChunkOutcome, UploadError>> + Send;

    /// Releases the session on the server.
    fn cancel_session(&self, session_uri: &str)
    -> impl Future<Output = Result<(), UploadError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    SessionOpen,
    Streaming,
    Completed,
    Failed,
}

/// Progress of one resumable upload, as checkpointed in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub attachment: AttachmentId,
    pub total_size: u64,
    /// Bytes the server has acknowledged.
    pub bytes_sent: u64,
    pub chunk_size: u64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_uri: Option<String>,
    /// Only set once the upload completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    pub state: SessionState,
}

impl UploadSession {
    pub fn new(
        attachment: AttachmentId,
        total_size: u64,
        chunk_size: u64,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            attachment,
            total_size,
            bytes_sent: 0,
            chunk_size,
            content_type: content_type.into(),
            session_uri: None,
            video_id: None,
            state: SessionState::Idle,
        }
    }

    /// Whether [`ResumableUpload::resume`] can pick this session up.
    pub fn is_resumable(&self) -> bool {
        self.session_uri.is_some() && self.state != SessionState::Completed
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        self.bytes_sent as f64 * 100.0 / self.total_size as f64
    }
}

/// Requests cancellation of an upload.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// The engine's end of a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation was requested. Pends forever if the handle is gone.
    pub async fn cancelled(&mut self) {
        let fired = self.rx.wait_for(|cancelled| *cancelled).await.is_ok();
        if !fired {
            std::future::pending::<()>().await;
        }
    }
}

/// Whether a session that failed with `e` is worth keeping for a later [`ResumableUpload::resume`].
fn keeps_session(e: &UploadError) -> bool {
    matches!(
        e,
        UploadError::Transient(_)
            | UploadError::Quota { .. }
            | UploadError::Local(_)
            | UploadError::Auth(_)
            | UploadError::Store(_)
    )
}

#[derive(Debug)]
pub struct ResumableUpload<T, S> {
    transport: Arc<T>,
    store: Arc<S>,
    settings: Settings,
}

impl<T, S> ResumableUpload<T, S>
where
    T: UploadTransport,
    S: Store,
{
    pub fn new(transport: Arc<T>, store: Arc<S>, settings: &Settings) -> Self {
        Self {
            transport,
            store,
            settings: settings.clone(),
        }
    }

    /// Uploads `total_size` bytes from `source` as a new video.
    #[instrument(skip(self, source, metadata, cancel))]
    pub async fn upload<Src>(
        &self,
        attachment: AttachmentId,
        mut source: Src,
        total_size: u64,
        content_type: &str,
        metadata: &VideoInsertRequest,
        mut cancel: CancelSignal,
    ) -> Result<Video, UploadError>
    where
        Src: AsyncRead + AsyncSeek + Unpin + Send,
    {
        if total_size == 0 {
            return Err(UploadError::Local(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to upload an empty file",
            )));
        }

        let mut session =
            UploadSession::new(attachment, total_size, self.settings.chunk_size, content_type);
        let request = SessionRequest {
            total_size,
            content_type: content_type.to_string(),
            body: metadata.clone(),
        };

        let session_uri = match self
            .timed(&mut cancel, self.transport.open_session(&request))
            .await
        {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(error = %e, "could not open upload session");
                return Err(e);
            }
        };
        tracing::debug!(%session_uri, "opened resumable upload session");
        session.session_uri = Some(session_uri);
        session.state = SessionState::SessionOpen;

        let result = match self.checkpoint(&session).await {
            Ok(()) => {
                self.stream(&mut source, &mut session, &mut cancel, false)
                    .await
            }
            Err(e) => Err(e),
        };
        self.conclude(&mut session, result).await
    }

    /// Continues a previously checkpointed session from the offset the server reports.
    #[instrument(skip_all, fields(attachment = session.attachment, bytes_sent = session.bytes_sent))]
    pub async fn resume<Src>(
        &self,
        mut source: Src,
        mut session: UploadSession,
        mut cancel: CancelSignal,
    ) -> Result<Video, UploadError>
    where
        Src: AsyncRead + AsyncSeek + Unpin + Send,
    {
        if !session.is_resumable() {
            return Err(UploadError::Protocol(
                "upload has no open session to resume".into(),
            ));
        }
        let result = self
            .stream(&mut source, &mut session, &mut cancel, true)
            .await;
        self.conclude(&mut session, result).await
    }

    /// Streams chunks until the server reports completion.
    ///
    /// With `resync` set, the first step is an offset query instead of a chunk.
    async fn stream<Src>(
        &self,
        source: &mut Src,
        session: &mut UploadSession,
        cancel: &mut CancelSignal,
        mut resync: bool,
    ) -> Result<Video, UploadError>
    where
        Src: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let Some(uri) = session.session_uri.clone() else {
            return Err(UploadError::Protocol("upload session has no URI".into()));
        };
        let total = session.total_size;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let offset = session.bytes_sent;
            let (step, sent_until) = if resync {
                tracing::debug!("querying server for persisted offset");
                let step = self
                    .timed(cancel, self.transport.query_offset(&uri, total))
                    .await;
                (step, None)
            } else {
                let len = (total - offset).min(session.chunk_size);
                let chunk = read_chunk(source, offset, len, total).await?;
                tracing::debug!(offset, len, "sending chunk");
                let step = self
                    .timed(cancel, self.transport.send_chunk(&uri, offset, chunk, total))
                    .await;
                (step, Some(offset + len))
            };

            match step {
                Ok(ChunkOutcome::Complete(video)) => {
                    if let Some(end) = sent_until {
                        if end != total {
                            return Err(UploadError::Integrity(format!(
                                "server completed the upload after {end} of {total} bytes"
                            )));
                        }
                    }
                    session.bytes_sent = total;
                    session.video_id = Some(video.id.clone());
                    session.state = SessionState::Completed;
                    return Ok(video);
                }
                Ok(ChunkOutcome::Incomplete { next_offset }) => {
                    if next_offset >= total {
                        return Err(UploadError::Integrity(format!(
                            "server acknowledged {next_offset} of {total} bytes without completing"
                        )));
                    }
                    if let Some(end) = sent_until {
                        if next_offset > end {
                            return Err(UploadError::Integrity(format!(
                                "server acknowledged {next_offset} bytes but only {end} were sent"
                            )));
                        }
                    }
                    if next_offset < offset {
                        tracing::warn!(
                            previous = offset,
                            next_offset,
                            "server offset went backwards, resending from its offset"
                        );
                    }
                    if next_offset > offset {
                        attempts = 0;
                    }
                    session.bytes_sent = next_offset;
                    session.state = SessionState::Streaming;
                    self.checkpoint(session).await?;
                    resync = false;
                }
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts > self.settings.max_chunk_retries {
                        tracing::error!(
                            offset,
                            attempts,
                            error = %e,
                            "giving up on chunk after repeated failures"
                        );
                        return Err(e);
                    }
                    let delay = match &e {
                        UploadError::Quota {
                            retry_after: Some(delay),
                            ..
                        } => *delay,
                        _ => self.settings.retry_delay(attempts),
                    };
                    tracing::warn!(offset, attempts, ?delay, error = %e, "chunk failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    resync = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Races `fut` against cancellation and the per-chunk timeout.
    async fn timed<F, O>(&self, cancel: &mut CancelSignal, fut: F) -> Result<O, UploadError>
    where
        F: Future<Output = Result<O, UploadError>>,
    {
        let limit = self.settings.chunk_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            r = tokio::time::timeout(limit, fut) => match r {
                Ok(r) => r,
                Err(_) => Err(UploadError::Transient(format!("no response within {limit:?}"))),
            },
        }
    }

    async fn checkpoint(&self, session: &UploadSession) -> Result<(), UploadError> {
        let snapshot = session.clone();
        self.store
            .update_item(session.attachment, move |item| item.session = Some(snapshot))
            .await?;
        Ok(())
    }

    /// Decides what happens to the session once streaming stopped.
    async fn conclude(
        &self,
        session: &mut UploadSession,
        result: Result<Video, UploadError>,
    ) -> Result<Video, UploadError> {
        let attachment = session.attachment;
        match &result {
            Ok(video) => {
                tracing::info!(video_id = video.id, "upload complete");
                self.store
                    .update_item(attachment, |item| item.session = None)
                    .await?;
            }
            Err(e) if keeps_session(e) => {
                session.state = SessionState::Failed;
                tracing::warn!(
                    bytes_sent = session.bytes_sent,
                    error = %e,
                    "upload interrupted, session kept for a later retry"
                );
                if let Err(store_err) = self.checkpoint(session).await {
                    tracing::warn!(error = %store_err, "could not checkpoint failed session");
                }
            }
            Err(e) => {
                session.state = SessionState::Failed;
                if matches!(e, UploadError::Cancelled) {
                    tracing::info!("upload cancelled, releasing session");
                } else {
                    tracing::error!(error = %e, "upload failed, discarding session");
                }
                if let Some(uri) = &session.session_uri {
                    self.release(uri).await;
                }
                if let Err(store_err) = self
                    .store
                    .update_item(attachment, |item| item.session = None)
                    .await
                {
                    tracing::warn!(error = %store_err, "could not discard session");
                }
            }
        }
        result
    }

    async fn release(&self, uri: &str) {
        let limit = self.settings.chunk_timeout();
        match tokio::time::timeout(limit, self.transport.cancel_session(uri)).await {
            Ok(Ok(())) => tracing::debug!("released upload session"),
            Ok(Err(e)) => tracing::warn!(error = %e, "could not release upload session"),
            Err(_) => tracing::warn!("timed out releasing upload session"),
        }
    }
}

/// Reads bytes `offset..offset + len` of a source declared to be `total` bytes long.
async fn read_chunk<Src>(
    source: &mut Src,
    offset: u64,
    len: u64,
    total: u64,
) -> Result<Bytes, UploadError>
where
    Src: AsyncRead + AsyncSeek + Unpin,
{
    source.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(UploadError::Integrity(format!(
                "source ended at byte {} but {total} bytes were declared",
                offset + filled as u64
            )));
        }
        filled += n;
    }
    if offset + len == total {
        let mut trailing = [0u8; 1];
        if source.read(&mut trailing).await? != 0 {
            return Err(UploadError::Integrity(format!(
                "source is larger than the declared {total} bytes"
            )));
        }
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use crate::youtube_api::{
        InsertStatus, Privacy, SnippetUpdate, UploadStatus, VideoStatus,
    };
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;
    const SESSION_URI: &str = "https://upload.test/session?upload_id=abc";

    #[derive(Debug, Clone)]
    enum Fault {
        /// The request never reaches the server.
        Drop,
        /// The server stores the chunk but the response is lost.
        LoseAck,
        /// The server never answers.
        Hang,
        Quota(Duration),
        /// The server claims one byte more than the whole upload.
        OverAck,
        /// The server claims completion right away.
        EarlyComplete,
    }

    #[derive(Debug, Default)]
    struct FakeState {
        received: Vec<u8>,
        opened: usize,
        sends: Vec<(u64, usize)>,
        queries: usize,
        released: Vec<String>,
        faults: Vec<Option<Fault>>,
    }

    #[derive(Debug, Default)]
    struct FakeTransport {
        state: Mutex<FakeState>,
    }

    impl FakeTransport {
        fn with_faults(faults: Vec<Option<Fault>>) -> Arc<Self> {
            let transport = Self::default();
            transport.state.lock().unwrap().faults = faults;
            Arc::new(transport)
        }

        fn accept(&self, offset: u64, chunk: &[u8], total: u64) -> ChunkOutcome {
            let mut state = self.state.lock().unwrap();
            assert_eq!(
                offset,
                state.received.len() as u64,
                "client sent a chunk that does not start at the persisted offset"
            );
            state.received.extend_from_slice(chunk);
            Self::outcome(&state, total)
        }

        fn outcome(state: &FakeState, total: u64) -> ChunkOutcome {
            if state.received.len() as u64 == total {
                ChunkOutcome::Complete(video())
            } else {
                ChunkOutcome::Incomplete {
                    next_offset: state.received.len() as u64,
                }
            }
        }
    }

    impl UploadTransport for FakeTransport {
        async fn open_session(&self, _request: &SessionRequest) -> Result<String, UploadError> {
            self.state.lock().unwrap().opened += 1;
            Ok(SESSION_URI.to_string())
        }

        async fn send_chunk(
            &self,
            _session_uri: &str,
            offset: u64,
            chunk: Bytes,
            total_size: u64,
        ) -> Result<ChunkOutcome, UploadError> {
            let fault = {
                let mut state = self.state.lock().unwrap();
                let index = state.sends.len();
                state.sends.push((offset, chunk.len()));
                state.faults.get(index).cloned().flatten()
            };
            match fault {
                None => Ok(self.accept(offset, &chunk, total_size)),
                Some(Fault::Drop) => Err(UploadError::Transient("connection reset".into())),
                Some(Fault::LoseAck) => {
                    self.accept(offset, &chunk, total_size);
                    Err(UploadError::Transient("connection reset".into()))
                }
                Some(Fault::Hang) => std::future::pending().await,
                Some(Fault::Quota(delay)) => Err(UploadError::Quota {
                    retry_after: Some(delay),
                    message: "rateLimitExceeded".into(),
                }),
                Some(Fault::OverAck) => Ok(ChunkOutcome::Incomplete {
                    next_offset: total_size + 1,
                }),
                Some(Fault::EarlyComplete) => Ok(ChunkOutcome::Complete(video())),
            }
        }

        async fn query_offset(
            &self,
            _session_uri: &str,
            total_size: u64,
        ) -> Result<ChunkOutcome, UploadError> {
            let mut state = self.state.lock().unwrap();
            state.queries += 1;
            Ok(Self::outcome(&state, total_size))
        }

        async fn cancel_session(&self, session_uri: &str) -> Result<(), UploadError> {
            self.state
                .lock()
                .unwrap()
                .released
                .push(session_uri.to_string());
            Ok(())
        }
    }

    fn video() -> Video {
        Video {
            id: "dQw4w9WgXcQ".into(),
            snippet: None,
            status: Some(VideoStatus {
                upload_status: UploadStatus::Uploaded,
                privacy_status: Some(Privacy::Private),
                failure_reason: None,
                rejection_reason: None,
            }),
        }
    }

    fn metadata() -> VideoInsertRequest {
        VideoInsertRequest {
            snippet: SnippetUpdate {
                title: "Holiday".into(),
                description: String::new(),
                tags: Vec::new(),
                category_id: "22".into(),
                extra: Default::default(),
            },
            status: InsertStatus {
                privacy_status: Privacy::Private,
            },
        }
    }

    fn data(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn engine(
        transport: &Arc<FakeTransport>,
    ) -> (ResumableUpload<FakeTransport, FileStore>, Arc<FileStore>) {
        let store = Arc::new(FileStore::in_memory());
        let engine = ResumableUpload::new(transport.clone(), store.clone(), &Settings::default());
        (engine, store)
    }

    async fn upload(
        engine: &ResumableUpload<FakeTransport, FileStore>,
        bytes: &[u8],
        declared: u64,
    ) -> Result<Video, UploadError> {
        engine
            .upload(
                1,
                Cursor::new(bytes.to_vec()),
                declared,
                "video/mp4",
                &metadata(),
                CancelSignal::never(),
            )
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_in_chunks() {
        let transport = FakeTransport::with_faults(vec![]);
        let (engine, store) = engine(&transport);
        let bytes = data(12 * MIB);

        let video = upload(&engine, &bytes, 12 * MIB).await.unwrap();
        assert_eq!(video.id, "dQw4w9WgXcQ");
        assert_eq!(video.upload_status(), Some(UploadStatus::Uploaded));

        let state = transport.state.lock().unwrap();
        assert_eq!(state.opened, 1);
        assert_eq!(
            state.sends,
            vec![
                (0, 5 * MIB as usize),
                (5 * MIB, 5 * MIB as usize),
                (10 * MIB, 2 * MIB as usize)
            ]
        );
        assert!(state.received == bytes);
        assert_eq!(store.item(1).await.unwrap().session, None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_resumes_from_server_offset() {
        let transport = FakeTransport::with_faults(vec![None, Some(Fault::Drop)]);
        let (engine, _store) = engine(&transport);
        let bytes = data(12 * MIB);

        let video = upload(&engine, &bytes, 12 * MIB).await.unwrap();
        assert_eq!(video.id, "dQw4w9WgXcQ");

        let state = transport.state.lock().unwrap();
        assert_eq!(state.opened, 1);
        assert_eq!(state.queries, 1);
        let offsets: Vec<u64> = state.sends.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![0, 5 * MIB, 5 * MIB, 10 * MIB]);
        assert!(state.received == bytes);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_ack_is_not_resent() {
        let transport = FakeTransport::with_faults(vec![None, Some(Fault::LoseAck)]);
        let (engine, _store) = engine(&transport);
        let bytes = data(12 * MIB);

        upload(&engine, &bytes, 12 * MIB).await.unwrap();

        let state = transport.state.lock().unwrap();
        let offsets: Vec<u64> = state.sends.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![0, 5 * MIB, 10 * MIB]);
        assert!(state.received == bytes);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_chunk_times_out_and_is_retried() {
        let transport = FakeTransport::with_faults(vec![Some(Fault::Hang)]);
        let (engine, _store) = engine(&transport);
        let bytes = data(MIB);

        let started = tokio::time::Instant::now();
        upload(&engine, &bytes, MIB).await.unwrap();
        assert!(started.elapsed() >= Settings::default().chunk_timeout());

        let state = transport.state.lock().unwrap();
        assert_eq!(state.sends.len(), 2);
        assert_eq!(state.queries, 1);
        assert!(state.received == bytes);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_waits_for_retry_after() {
        let transport =
            FakeTransport::with_faults(vec![Some(Fault::Quota(Duration::from_secs(30)))]);
        let (engine, _store) = engine(&transport);
        let bytes = data(MIB);

        let started = tokio::time::Instant::now();
        upload(&engine, &bytes, MIB).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn short_source_is_integrity_error() {
        let transport = FakeTransport::with_faults(vec![]);
        let (engine, store) = engine(&transport);
        let bytes = data(11 * MIB);

        let err = upload(&engine, &bytes, 12 * MIB).await.unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)), "{err:?}");
        assert!(!err.is_retryable());

        let state = transport.state.lock().unwrap();
        // only the two full chunks went out
        assert_eq!(state.sends.len(), 2);
        assert_eq!(state.released, vec![SESSION_URI.to_string()]);
        assert_eq!(store.item(1).await.unwrap().session, None);
    }

    #[tokio::test(start_paused = true)]
    async fn long_source_is_integrity_error() {
        let transport = FakeTransport::with_faults(vec![]);
        let (engine, _store) = engine(&transport);
        let bytes = data(3 * MIB);

        let err = upload(&engine, &bytes, 2 * MIB).await.unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)), "{err:?}");
        assert!(transport.state.lock().unwrap().sends.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn server_overacknowledging_is_integrity_error() {
        let transport = FakeTransport::with_faults(vec![Some(Fault::OverAck)]);
        let (engine, _store) = engine(&transport);
        let err = upload(&engine, &data(12 * MIB), 12 * MIB)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)), "{err:?}");
        assert_eq!(transport.state.lock().unwrap().sends.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn early_completion_is_integrity_error() {
        let transport = FakeTransport::with_faults(vec![Some(Fault::EarlyComplete)]);
        let (engine, _store) = engine(&transport);
        let err = upload(&engine, &data(12 * MIB), 12 * MIB)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Integrity(_)), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_source_is_rejected() {
        let transport = FakeTransport::with_faults(vec![]);
        let (engine, _store) = engine(&transport);
        let err = upload(&engine, &[], 0).await.unwrap_err();
        assert!(matches!(err, UploadError::Local(_)), "{err:?}");
        assert_eq!(transport.state.lock().unwrap().opened, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_the_session() {
        let transport = FakeTransport::with_faults(vec![None, Some(Fault::Hang)]);
        let (engine, store) = engine(&transport);
        let bytes = data(12 * MIB);
        let handle = CancelHandle::new();
        let meta = metadata();

        let (result, ()) = tokio::join!(
            engine.upload(
                1,
                Cursor::new(bytes),
                12 * MIB,
                "video/mp4",
                &meta,
                handle.signal()
            ),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                handle.cancel();
            }
        );
        assert!(matches!(result, Err(UploadError::Cancelled)), "{result:?}");

        let state = transport.state.lock().unwrap();
        assert_eq!(state.sends.len(), 2);
        assert_eq!(state.released, vec![SESSION_URI.to_string()]);
        assert_eq!(store.item(1).await.unwrap().session, None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_a_resumable_session() {
        let mut faults = vec![None];
        faults.extend(std::iter::repeat_n(Some(Fault::Drop), 6));
        let transport = FakeTransport::with_faults(faults);
        let (engine, store) = engine(&transport);
        let bytes = data(12 * MIB);

        let err = upload(&engine, &bytes, 12 * MIB).await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");

        let session = store.item(1).await.unwrap().session.unwrap();
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.bytes_sent, 5 * MIB);
        assert_eq!(session.session_uri.as_deref(), Some(SESSION_URI));
        assert!(session.is_resumable());
        assert!(transport.state.lock().unwrap().released.is_empty());

        let video = engine
            .resume(Cursor::new(bytes.clone()), session, CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(video.id, "dQw4w9WgXcQ");

        let state = transport.state.lock().unwrap();
        assert_eq!(state.opened, 1);
        let tail: Vec<u64> = state.sends[7..].iter().map(|(o, _)| *o).collect();
        assert_eq!(tail, vec![5 * MIB, 10 * MIB]);
        assert!(state.received == bytes);
        assert_eq!(store.item(1).await.unwrap().session, None);
    }

    #[tokio::test]
    async fn completed_session_is_not_resumable() {
        let transport = FakeTransport::with_faults(vec![]);
        let (engine, _store) = engine(&transport);
        let mut session = UploadSession::new(1, 10, 10, "video/mp4");
        assert!(!session.is_resumable());
        session.session_uri = Some(SESSION_URI.into());
        session.state = SessionState::Completed;
        let err = engine
            .resume(Cursor::new(vec![0; 10]), session, CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn session_progress() {
        let mut session = UploadSession::new(1, 4 * MIB, MIB, "video/mp4");
        assert_eq!(session.progress_percent(), 0.0);
        session.bytes_sent = MIB;
        assert_eq!(session.progress_percent(), 25.0);
    }
}
