//! Video metadata: what is sent to YouTube for an attachment, and pushing later edits.

use crate::attachment::Attachment;
use crate::config::Settings;
use crate::error::UploadError;
use crate::youtube_api::{
    InsertStatus, Privacy, SnippetUpdate, VideoInsertRequest, VideoService, VideoUpdateRequest,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// YouTube rejects longer titles.
pub const MAX_TITLE_CHARS: usize = 100;

/// YouTube rejects longer descriptions.
pub const MAX_DESCRIPTION_BYTES: usize = 5000;

/// The locally owned fields of a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy: Privacy,
}

impl VideoMetadata {
    /// Trims the fields to what YouTube accepts.
    ///
    /// Angle brackets are not allowed in titles or descriptions and are dropped.
    pub fn normalized(mut self) -> Self {
        self.title = clean(&self.title);
        if let Some((cut, _)) = self.title.char_indices().nth(MAX_TITLE_CHARS) {
            self.title.truncate(cut);
        }
        self.description = clean(&self.description);
        if self.description.len() > MAX_DESCRIPTION_BYTES {
            let mut cut = MAX_DESCRIPTION_BYTES;
            while !self.description.is_char_boundary(cut) {
                cut -= 1;
            }
            self.description.truncate(cut);
        }
        self.tags.retain(|t| !t.trim().is_empty());
        self
    }

    /// The first `max_chars` characters of the description, with an ellipsis if cut short.
    pub fn excerpt(&self, max_chars: usize) -> String {
        match self.description.char_indices().nth(max_chars) {
            Some((cut, _)) => format!("{}…", &self.description[..cut]),
            None => self.description.clone(),
        }
    }

    fn snippet(&self) -> SnippetUpdate {
        SnippetUpdate {
            title: self.title.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            category_id: self.category_id.clone(),
            extra: Default::default(),
        }
    }

    pub fn to_insert_request(&self) -> VideoInsertRequest {
        VideoInsertRequest {
            snippet: self.snippet(),
            status: InsertStatus {
                privacy_status: self.privacy,
            },
        }
    }
}

fn clean(s: &str) -> String {
    s.chars().filter(|c| !matches!(c, '<' | '>')).collect::<String>().trim().to_string()
}

/// Removes markup tags (`<p>`, `<a href=..>`, ...) and collapses the whitespace they leave.
pub fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decides the title, description, tags, category and privacy of an attachment's video.
pub trait MetadataProvider: Send + Sync {
    /// `previous` is what was last sent to YouTube for this attachment, if anything.
    fn metadata(
        &self,
        attachment: &Attachment,
        settings: &Settings,
        previous: Option<&VideoMetadata>,
    ) -> VideoMetadata;
}

/// Takes title and description from the attachment. Tags, category and privacy come from the
/// overrides here, then from what was sent before, then from configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentMetadata {
    pub tags: Vec<String>,
    pub category_id: Option<String>,
    pub privacy: Option<Privacy>,
}

impl MetadataProvider for AttachmentMetadata {
    fn metadata(
        &self,
        attachment: &Attachment,
        settings: &Settings,
        previous: Option<&VideoMetadata>,
    ) -> VideoMetadata {
        let title = match attachment.title.trim() {
            "" => attachment.file_stem(),
            title => title.to_string(),
        };
        let tags = match (self.tags.is_empty(), previous) {
            (true, Some(previous)) => previous.tags.clone(),
            _ => self.tags.clone(),
        };
        VideoMetadata {
            title,
            description: strip_tags(&attachment.description),
            tags,
            category_id: self
                .category_id
                .clone()
                .or_else(|| previous.map(|p| p.category_id.clone()))
                .unwrap_or_else(|| settings.default_category.clone()),
            privacy: self
                .privacy
                .or(previous.map(|p| p.privacy))
                .unwrap_or(settings.default_privacy),
        }
        .normalized()
    }
}

/// Overlays the local fields onto the remote snippet of `video_id`; the other snippet fields
/// (languages and the like) are sent back as fetched.
///
/// Returns `Ok(true)` once YouTube accepted the update. A video deleted on YouTube is
/// [`UploadError::NotFound`].
#[instrument(skip(videos, metadata))]
pub async fn update_remote<V>(
    videos: &V,
    video_id: &str,
    metadata: &VideoMetadata,
) -> Result<bool, UploadError>
where
    V: VideoService,
{
    let current = videos.get_video(video_id, "snippet").await?;
    let snippet = match &current.snippet {
        Some(remote) => metadata.snippet().preserving(remote),
        None => {
            tracing::debug!("remote video has no snippet, writing local fields as-is");
            metadata.snippet()
        }
    };
    let update = VideoUpdateRequest {
        id: current.id,
        snippet,
    };
    videos.update_video(&update).await?;
    tracing::debug!("pushed metadata to YouTube");
    Ok(true)
}
