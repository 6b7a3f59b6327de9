//! Uploads local video files to YouTube and follows them through processing.
//!
//! The crate is layered the way a request flows:
//!
//! - [`token`] keeps a valid OAuth access token, refreshing it through [`oauth`];
//! - [`upload`] streams a file over the resumable upload protocol, checkpointing its progress;
//! - [`poller`] checks a bounded number of times whether YouTube finished processing;
//! - [`attachment`] ties these together per media item and records everything in a [`store`].

pub mod attachment;
pub mod config;
pub mod error;
pub mod metadata;
pub mod oauth;
pub mod poller;
pub mod store;
pub mod token;
pub mod upload;
pub mod youtube_api;

pub use attachment::{Attachment, AttachmentUploader};
pub use config::Settings;
pub use error::{AuthError, UploadError};
pub use store::{FileStore, Store};
pub use upload::{CancelHandle, CancelSignal};

use crate::metadata::AttachmentMetadata;
use crate::oauth::OAuthManager;
use crate::token::TokenManager;
use crate::youtube_api::{YouTubeClient, http_client};
use std::sync::Arc;

/// The API client as wired for production use.
pub type Client = YouTubeClient<OAuthManager, FileStore>;

/// The orchestrator as wired for production use.
pub type Uploader<P = AttachmentMetadata> = AttachmentUploader<Client, FileStore, P>;

/// Builds the API client over `store`, seeded with the token persisted there.
pub async fn setup_client(settings: &Settings, store: Arc<FileStore>) -> Result<Client, UploadError> {
    let oauth = OAuthManager::new(settings)?;
    let tokens = TokenManager::load(oauth, store).await?;
    Ok(YouTubeClient::new(
        Arc::new(tokens),
        settings.endpoints.clone(),
        http_client()?,
    ))
}

/// Builds the attachment workflow on top of [`setup_client`].
pub async fn setup_uploader<P>(
    settings: &Settings,
    store: Arc<FileStore>,
    metadata: P,
) -> Result<Uploader<P>, UploadError>
where
    P: metadata::MetadataProvider,
{
    let client = setup_client(settings, store.clone()).await?;
    Ok(AttachmentUploader::new(
        Arc::new(client),
        store,
        settings.clone(),
        metadata,
    ))
}
