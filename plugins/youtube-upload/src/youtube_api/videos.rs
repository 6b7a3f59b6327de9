//! YouTube Videos API types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Response structure for the `videos.list` API call.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos/list>
#[derive(Debug, Serialize, Deserialize)]
pub struct VideoListResponse {
    /// Identifies the API resource's type.
    ///
    /// The value will be `youtube#videoListResponse`.
    #[serde(default)]
    pub kind: String,
    /// A list of videos that match the request criteria.
    ///
    /// The API omits the field entirely when nothing matched.
    #[serde(default)]
    pub items: Vec<Video>,
}

/// A `video` resource represents a YouTube video.
///
/// Only the parts requested through the `part` query parameter are present, which is why
/// both [`VideoSnippet`] and [`VideoStatus`] are optional.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos#resource>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    /// The ID that YouTube uses to uniquely identify the video.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<VideoSnippet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VideoStatus>,
}

impl Video {
    pub fn upload_status(&self) -> Option<UploadStatus> {
        self.status.as_ref().map(|s| s.upload_status)
    }
}

/// Basic details about a video: title, description, tags, category and thumbnails.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos#snippet>
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnippet {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// The YouTube video category associated with the video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnails: Option<Thumbnails>,
    /// Fields not modelled here (`defaultLanguage`, `defaultAudioLanguage`, ...), kept so that
    /// an update can send them back unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Snippet fields YouTube computes itself and ignores on update.
const READ_ONLY_SNIPPET_FIELDS: &[&str] = &["channelTitle", "liveBroadcastContent", "localized"];

/// Thumbnail images associated with the video, keyed by size.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thumbnails {
    /// 120x90
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Thumbnail>,
    /// 320x180
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<Thumbnail>,
    /// 480x360
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<Thumbnail>,
}

impl Thumbnails {
    /// Picks the smallest of default/medium/high that covers `min_width` x `min_height`,
    /// falling back to the largest one present.
    pub fn best_fit(&self, min_width: u32, min_height: u32) -> Option<&Thumbnail> {
        let candidates = [&self.default, &self.medium, &self.high];
        candidates
            .iter()
            .filter_map(|t| t.as_ref())
            .find(|t| t.width.unwrap_or(0) >= min_width && t.height.unwrap_or(0) >= min_height)
            .or_else(|| candidates.iter().rev().find_map(|t| t.as_ref()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Upload, processing and privacy status of a video.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos#status>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub upload_status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_status: Option<Privacy>,
    /// Explains why a video failed to upload. Only set when `upload_status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Explains why YouTube rejected an uploaded video. Only set when `upload_status` is `rejected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// The remote-side lifecycle state of an uploaded video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadStatus {
    Uploaded,
    Processing,
    Processed,
    Failed,
    Rejected,
    Deleted,
}

impl UploadStatus {
    /// A terminal status will not change on its own, so there is no point in polling further.
    pub fn is_terminal(self) -> bool {
        !matches!(self, UploadStatus::Uploaded | UploadStatus::Processing)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Processing => "processing",
            UploadStatus::Processed => "processed",
            UploadStatus::Failed => "failed",
            UploadStatus::Rejected => "rejected",
            UploadStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Who can see the video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Unlisted,
    #[default]
    Private,
}

impl Privacy {
    pub const ALL: [Privacy; 3] = [Privacy::Public, Privacy::Unlisted, Privacy::Private];

    pub fn as_str(self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Unlisted => "unlisted",
            Privacy::Private => "private",
        }
    }
}

impl fmt::Display for Privacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Privacy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Privacy::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown privacy status '{s}' (expected public, unlisted or private)"))
    }
}

/// The writable subset of a snippet, as sent on insert and update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetUpdate {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    /// Remote fields carried over on update.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SnippetUpdate {
    /// Carries over the fields of `current` this update does not set.
    pub fn preserving(mut self, current: &VideoSnippet) -> Self {
        self.extra = current
            .extra
            .iter()
            .filter(|(k, _)| !READ_ONLY_SNIPPET_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self
    }
}

/// Request body for `videos.insert` with `part=snippet,status`.
#[derive(Debug, Clone, Serialize)]
pub struct VideoInsertRequest {
    pub snippet: SnippetUpdate,
    pub status: InsertStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertStatus {
    pub privacy_status: Privacy,
}

/// Request body for `videos.update` with `part=snippet`.
///
/// See: <https://developers.google.com/youtube/v3/docs/videos/update>
#[derive(Debug, Clone, Serialize)]
pub struct VideoUpdateRequest {
    pub id: String,
    pub snippet: SnippetUpdate,
}
