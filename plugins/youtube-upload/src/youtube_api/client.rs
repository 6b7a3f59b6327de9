//! Core YouTube API client functionality.

use crate::config::Endpoints;
use crate::error::UploadError;
use crate::store::Store;
use crate::token::{TokenManager, TokenRefresher};
use crate::youtube_api::types::{classify_error, retry_after};
use crate::youtube_api::videos::{Video, VideoListResponse, VideoUpdateRequest};
use http::{Method, StatusCode};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::instrument;

/// The `videos` resource operations the metadata updater and the status poller rely on.
pub trait VideoService: Send + Sync {
    /// `videos.list` for a single id. A video that does not exist is [`UploadError::NotFound`].
    fn get_video(
        &self,
        video_id: &str,
        parts: &str,
    ) -> impl Future<Output = Result<Video, UploadError>> + Send;

    /// `videos.update` with `part=snippet`.
    fn update_video(
        &self,
        update: &VideoUpdateRequest,
    ) -> impl Future<Output = Result<Video, UploadError>> + Send;
}

/// Builds the HTTP client used for API calls.
///
/// Redirects are never followed: the resumable upload protocol answers `308` for "keep going",
/// and that response has to reach the upload engine as-is.
pub fn http_client() -> Result<reqwest::Client, UploadError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| UploadError::Config(format!("build HTTP client: {e}")))
}

/// Client for interacting with the YouTube Data API v3.
///
/// Every request carries a bearer token from the shared [`TokenManager`]. If the API still
/// rejects it with `401`, the token is force-refreshed once and the request replayed.
pub struct YouTubeClient<R, S> {
    tokens: Arc<TokenManager<R, S>>,
    /// HTTP client for API requests
    client: reqwest::Client,
    endpoints: Arc<Endpoints>,
}

impl<R, S> Clone for YouTubeClient<R, S> {
    fn clone(&self) -> Self {
        Self {
            tokens: Arc::clone(&self.tokens),
            client: self.client.clone(),
            endpoints: Arc::clone(&self.endpoints),
        }
    }
}

impl<R, S> fmt::Debug for YouTubeClient<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTubeClient")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl<R, S> YouTubeClient<R, S>
where
    R: TokenRefresher,
    S: Store,
{
    pub fn new(
        tokens: Arc<TokenManager<R, S>>,
        endpoints: Endpoints,
        client: reqwest::Client,
    ) -> Self {
        Self {
            tokens,
            client,
            endpoints: Arc::new(endpoints),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager<R, S>> {
        &self.tokens
    }

    pub(crate) fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Sends the request produced by `build` with a bearer token attached.
    ///
    /// `build` may be called twice: once with the current token and, after a `401`, once more
    /// with a refreshed one. The response is returned whatever its status.
    #[instrument(skip(self, build), level = tracing::Level::TRACE)]
    pub(crate) async fn send_authenticated<F>(
        &self,
        build: F,
    ) -> Result<reqwest::Response, UploadError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let bearer = self.tokens.access_token().await?;
        let response = build(&self.client)
            .bearer_auth(&bearer.secret)
            .send()
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!("access token rejected by the API, refreshing once");
        let bearer = self.tokens.force_refresh(bearer.generation).await?;
        let response = build(&self.client)
            .bearer_auth(&bearer.secret)
            .send()
            .await?;
        Ok(response)
    }

    /// Makes an authenticated request and turns any non-success status into an error.
    #[instrument(skip(self, json_body), level = tracing::Level::TRACE)]
    pub(crate) async fn make_authenticated_request(
        &self,
        method: Method,
        url: &str,
        query_params: &[(&str, &str)],
        json_body: Option<&(impl Serialize + Sync)>,
    ) -> Result<reqwest::Response, UploadError> {
        let response = self
            .send_authenticated(|client| {
                let request = client.request(method.clone(), url).query(query_params);
                match json_body {
                    Some(body) => request.json(body),
                    None => request,
                }
            })
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

/// Reads the body of a failed response and classifies it.
pub(crate) async fn error_from_response(response: reqwest::Response) -> UploadError {
    let status = response.status();
    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let err = classify_error(status, retry_after, &body);
    tracing::debug!(%status, error = %err, "YouTube API request failed");
    err
}

impl<R, S> VideoService for YouTubeClient<R, S>
where
    R: TokenRefresher,
    S: Store,
{
    /// Uses the `videos.list` API.
    ///
    /// # API Reference
    ///
    /// <https://developers.google.com/youtube/v3/docs/videos/list>
    #[instrument(skip(self))]
    async fn get_video(&self, video_id: &str, parts: &str) -> Result<Video, UploadError> {
        let url = format!("{}/videos", self.endpoints.api_base);
        let response = self
            .make_authenticated_request(
                Method::GET,
                &url,
                &[("part", parts), ("id", video_id)],
                None::<&()>,
            )
            .await?;

        let list: VideoListResponse = response.json().await?;
        list.items
            .into_iter()
            .next()
            .ok_or_else(|| UploadError::NotFound(format!("video {video_id}")))
    }

    /// Uses the `videos.update` API. Only the snippet is sent; YouTube replaces the whole part,
    /// so the caller must start from the current remote snippet.
    ///
    /// # API Reference
    ///
    /// <https://developers.google.com/youtube/v3/docs/videos/update>
    #[instrument(skip(self, update), fields(video_id = %update.id))]
    async fn update_video(&self, update: &VideoUpdateRequest) -> Result<Video, UploadError> {
        let url = format!("{}/videos", self.endpoints.api_base);
        let response = self
            .make_authenticated_request(Method::PUT, &url, &[("part", "snippet")], Some(update))
            .await?;

        let video: Video = response.json().await?;
        tracing::debug!(video_id = video.id, "successfully updated video");
        Ok(video)
    }
}
