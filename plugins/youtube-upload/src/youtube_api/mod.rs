//! YouTube Data API v3 client library.
//!
//! Covers the two corners of the API an uploader needs: the `videos` resource (read the
//! snippet and status of a video, update its snippet) and the resumable media upload
//! endpoint that creates the video in the first place.
//!
//! All requests go through [`YouTubeClient`], which attaches a bearer token from the shared
//! [`TokenManager`](crate::token::TokenManager) and classifies failures into
//! [`UploadError`](crate::error::UploadError).

pub mod client;
pub mod types;
pub mod upload;
pub mod videos;

pub use client::{VideoService, YouTubeClient, http_client};

pub use videos::{
    InsertStatus, Privacy, SnippetUpdate, Thumbnail, Thumbnails, UploadStatus, Video,
    VideoInsertRequest, VideoSnippet, VideoStatus, VideoUpdateRequest,
};
