use clap::{Parser, Subcommand};
use eyre::Context;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use youtube_upload::attachment::DEFAULT_THUMBNAIL_SIZE;
use youtube_upload::metadata::AttachmentMetadata;
use youtube_upload::oauth::OAuthManager;
use youtube_upload::store::AttachmentId;
use youtube_upload::youtube_api::Privacy;
use youtube_upload::{
    Attachment, CancelHandle, FileStore, Settings, Store, Uploader, setup_client, setup_uploader,
};

/// Upload videos to YouTube and follow their processing.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// JSON settings file.
    #[arg(long, global = true, default_value = "youtube-upload.json")]
    config: PathBuf,
    /// Where tokens, upload checkpoints and video state are kept.
    #[arg(long, global = true, default_value = "youtube-upload-state.json")]
    state: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the browser consent flow and store the resulting tokens.
    Auth,
    /// Upload a video file as attachment `id`.
    Upload {
        id: AttachmentId,
        path: PathBuf,
        #[command(flatten)]
        meta: MetaArgs,
        /// Return once the bytes are up instead of waiting for processing.
        #[arg(long)]
        no_wait: bool,
    },
    /// Retry an earlier upload that failed or was interrupted.
    Retry {
        id: AttachmentId,
        #[arg(long)]
        no_wait: bool,
    },
    /// Push edited title or description of an uploaded attachment.
    Update {
        id: AttachmentId,
        #[command(flatten)]
        meta: MetaArgs,
    },
    /// Fetch the current processing status from YouTube.
    Status { id: AttachmentId },
    /// Run the scheduled status checks of one attachment.
    Watch { id: AttachmentId },
    /// Run all scheduled status checks.
    WatchAll,
    /// Print what is known locally about an attachment.
    Show { id: AttachmentId },
    /// Abandon an unfinished upload.
    Cancel { id: AttachmentId },
}

#[derive(Debug, clap::Args)]
struct MetaArgs {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    privacy: Option<Privacy>,
}

impl MetaArgs {
    fn provider(&self) -> AttachmentMetadata {
        AttachmentMetadata {
            tags: self.tags.clone(),
            category_id: self.category.clone(),
            privacy: self.privacy,
        }
    }

    fn apply(&self, attachment: &mut Attachment) {
        if let Some(title) = &self.title {
            attachment.title = title.clone();
        }
        if let Some(description) = &self.description {
            attachment.description = description.clone();
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .await
        .with_context(|| format!("load settings from {}", cli.config.display()))?;
    let store = Arc::new(
        FileStore::open(&cli.state)
            .await
            .with_context(|| format!("open state file {}", cli.state.display()))?,
    );

    match cli.command {
        Command::Auth => {
            let client = setup_client(&settings, store).await.context("set up client")?;
            let oauth = OAuthManager::new(&settings)?;
            let token = oauth.authenticate().await.context("authenticate with YouTube")?;
            client
                .tokens()
                .install(&token)
                .await
                .context("store new tokens")?;
            eprintln!("authenticated; tokens saved to {}", cli.state.display());
        }
        Command::Upload {
            id,
            path,
            meta,
            no_wait,
        } => {
            let mut attachment = Attachment::from_path(id, path);
            meta.apply(&mut attachment);
            let uploader = uploader(&settings, store, meta.provider()).await?;
            upload(&uploader, &attachment, no_wait).await?;
        }
        Command::Retry { id, no_wait } => {
            let uploader = uploader(&settings, store, AttachmentMetadata::default()).await?;
            let cancel = cancel_on_ctrl_c();
            match uploader
                .retry(id, cancel.signal())
                .await
                .with_context(|| format!("retry upload of attachment {id}"))?
            {
                Some(video) => {
                    eprintln!("uploaded as {}", video.id);
                    if !no_wait {
                        watch(&uploader, id).await?;
                    }
                }
                None => eprintln!("attachment {id} is already uploaded"),
            }
        }
        Command::Update { id, meta } => {
            let uploader = uploader(&settings, store, meta.provider()).await?;
            let mut attachment = uploader
                .item(id)
                .await?
                .attachment
                .ok_or_else(|| eyre::eyre!("attachment {id} was never uploaded"))?;
            meta.apply(&mut attachment);
            if uploader
                .update(&attachment)
                .await
                .with_context(|| format!("update video of attachment {id}"))?
            {
                eprintln!("video updated");
            } else {
                eprintln!("attachment {id} is not uploaded yet");
            }
        }
        Command::Status { id } => {
            let uploader = uploader(&settings, store, AttachmentMetadata::default()).await?;
            match uploader.refresh_upload_data(id).await? {
                Some(video) => match video.upload_status() {
                    Some(status) => println!("{}: {status}", video.id),
                    None => println!("{}: status unknown", video.id),
                },
                None => println!("attachment {id} is not uploaded"),
            }
        }
        Command::Watch { id } => {
            let uploader = uploader(&settings, store, AttachmentMetadata::default()).await?;
            watch(&uploader, id).await?;
        }
        Command::WatchAll => {
            let uploader = Arc::new(uploader(&settings, store, AttachmentMetadata::default()).await?);
            for task in uploader.resume_pending_polls().await? {
                match task.await {
                    Ok(Ok(reason)) => tracing::info!(?reason, "status checks done"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "status checks failed"),
                    Err(e) => tracing::warn!(error = %e, "status check task panicked"),
                }
            }
        }
        Command::Show { id } => {
            let item = store.item(id).await?;
            if let Some(meta) = &item.metadata {
                eprintln!("{}: {}", meta.title, meta.excerpt(80));
            }
            if let Some(session) = item.session.as_ref().filter(|s| s.is_resumable()) {
                eprintln!("upload {:.0}% done", session.progress_percent());
            }
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Command::Cancel { id } => {
            let uploader = uploader(&settings, store, AttachmentMetadata::default()).await?;
            if uploader.cancel(id).await? {
                eprintln!("upload of attachment {id} abandoned");
            } else {
                eprintln!("attachment {id} has no unfinished upload");
            }
        }
    }

    Ok(())
}

async fn uploader(
    settings: &Settings,
    store: Arc<FileStore>,
    metadata: AttachmentMetadata,
) -> eyre::Result<Uploader> {
    let uploader = setup_uploader(settings, store, metadata)
        .await
        .context("set up uploader")?;
    Ok(uploader)
}

/// Cancels the returned handle on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping upload at the next chunk boundary");
            handle.cancel();
        }
    });
    cancel
}

async fn upload(uploader: &Uploader, attachment: &Attachment, no_wait: bool) -> eyre::Result<()> {
    let cancel = cancel_on_ctrl_c();
    let video = uploader
        .upload(attachment, cancel.signal())
        .await
        .with_context(|| format!("upload {}", attachment.path.display()))?;
    eprintln!("uploaded as {}", video.id);
    if let Some(url) = uploader.embed_url(attachment.id).await? {
        println!("{url}");
    }
    if !no_wait {
        watch(uploader, attachment.id).await?;
    }
    Ok(())
}

async fn watch(uploader: &Uploader, id: AttachmentId) -> eyre::Result<()> {
    match uploader
        .run_status_checks(id)
        .await
        .with_context(|| format!("check status of attachment {id}"))?
    {
        Some(reason) => eprintln!("status checks stopped: {reason:?}"),
        None => eprintln!("no status checks scheduled for attachment {id}"),
    }
    let (w, h) = DEFAULT_THUMBNAIL_SIZE;
    if let Some(thumbnail) = uploader.thumbnail(id, w, h).await? {
        println!("{}", thumbnail.url);
    }
    Ok(())
}
