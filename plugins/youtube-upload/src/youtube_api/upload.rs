//! The resumable upload protocol over HTTP.
//!
//! See: <https://developers.google.com/youtube/v3/guides/using_resumable_upload_protocol>

use crate::error::UploadError;
use crate::store::Store;
use crate::token::TokenRefresher;
use crate::upload::{ChunkOutcome, SessionRequest, UploadTransport};
use crate::youtube_api::client::{YouTubeClient, error_from_response};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use http::{HeaderMap, StatusCode};
use tracing::instrument;

/// Google answers a successful session `DELETE` with this non-standard code.
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl<R, S> UploadTransport for YouTubeClient<R, S>
where
    R: TokenRefresher,
    S: Store,
{
    #[instrument(skip(self, request), fields(total_size = request.total_size))]
    async fn open_session(&self, request: &SessionRequest) -> Result<String, UploadError> {
        let url = format!("{}/videos", self.endpoints().upload_base);
        let total = request.total_size.to_string();
        let response = self
            .send_authenticated(|client| {
                client
                    .post(&url)
                    .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
                    .header("X-Upload-Content-Length", total.as_str())
                    .header("X-Upload-Content-Type", request.content_type.as_str())
                    .json(&request.body)
            })
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| {
                UploadError::Protocol("session response carried no Location header".into())
            })?
            .to_str()
            .map_err(|_| UploadError::Protocol("Location header is not valid UTF-8".into()))?;
        let session_uri = response
            .url()
            .join(location)
            .map_err(|e| UploadError::Protocol(format!("invalid session URI '{location}': {e}")))?;
        Ok(session_uri.to_string())
    }

    #[instrument(skip(self, session_uri, chunk), fields(len = chunk.len()))]
    async fn send_chunk(
        &self,
        session_uri: &str,
        offset: u64,
        chunk: Bytes,
        total_size: u64,
    ) -> Result<ChunkOutcome, UploadError> {
        let Some(last) = (chunk.len() as u64).checked_sub(1) else {
            return Err(UploadError::Integrity("refusing to send an empty chunk".into()));
        };
        let range = format!("bytes {offset}-{}/{total_size}", offset + last);
        let response = self
            .send_authenticated(|client| {
                client
                    .put(session_uri)
                    .header(CONTENT_RANGE, range.as_str())
                    .body(chunk.clone())
            })
            .await?;
        chunk_outcome(response).await
    }

    #[instrument(skip(self, session_uri))]
    async fn query_offset(
        &self,
        session_uri: &str,
        total_size: u64,
    ) -> Result<ChunkOutcome, UploadError> {
        let range = format!("bytes */{total_size}");
        let response = self
            .send_authenticated(|client| {
                client
                    .put(session_uri)
                    .header(CONTENT_RANGE, range.as_str())
                    .header(CONTENT_LENGTH, "0")
            })
            .await?;
        chunk_outcome(response).await
    }

    #[instrument(skip_all)]
    async fn cancel_session(&self, session_uri: &str) -> Result<(), UploadError> {
        let response = self
            .send_authenticated(|client| client.delete(session_uri))
            .await?;
        let status = response.status();
        if status.is_success()
            || status.as_u16() == CLIENT_CLOSED_REQUEST
            || status == StatusCode::NOT_FOUND
        {
            return Ok(());
        }
        Err(error_from_response(response).await)
    }
}

async fn chunk_outcome(response: reqwest::Response) -> Result<ChunkOutcome, UploadError> {
    match response.status() {
        StatusCode::OK | StatusCode::CREATED => Ok(ChunkOutcome::Complete(response.json().await?)),
        StatusCode::PERMANENT_REDIRECT => Ok(ChunkOutcome::Incomplete {
            next_offset: next_offset(response.headers())?,
        }),
        _ => Err(error_from_response(response).await),
    }
}

/// The offset to continue from after a `308`.
///
/// No `Range` header means the server has not persisted anything yet.
fn next_offset(headers: &HeaderMap) -> Result<u64, UploadError> {
    let Some(value) = headers.get(RANGE) else {
        return Ok(0);
    };
    let value = value
        .to_str()
        .map_err(|_| UploadError::Protocol("Range header is not valid UTF-8".into()))?;
    parse_range(value)
        .ok_or_else(|| UploadError::Protocol(format!("malformed Range header '{value}'")))
}

/// Parses `bytes=0-N` into `N + 1`.
fn parse_range(value: &str) -> Option<u64> {
    let (start, end) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    if start.trim().parse::<u64>().ok()? != 0 {
        return None;
    }
    end.trim().parse::<u64>().ok()?.checked_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header() {
        assert_eq!(parse_range("bytes=0-524287"), Some(524288));
        assert_eq!(parse_range("bytes=0-0"), Some(1));
        assert_eq!(parse_range(" bytes=0-41 "), Some(42));
        assert_eq!(parse_range("bytes=10-20"), None);
        assert_eq!(parse_range("bytes=0-"), None);
        assert_eq!(parse_range("0-100"), None);
        assert_eq!(parse_range("bytes=0-abc"), None);
    }

    #[test]
    fn missing_range_means_nothing_persisted() {
        let mut headers = HeaderMap::new();
        assert_eq!(next_offset(&headers).unwrap(), 0);

        headers.insert(RANGE, "bytes=0-5242879".parse().unwrap());
        assert_eq!(next_offset(&headers).unwrap(), 5 * 1024 * 1024);

        headers.insert(RANGE, "items=0-1".parse().unwrap());
        assert!(matches!(
            next_offset(&headers),
            Err(UploadError::Protocol(_))
        ));
    }
}
