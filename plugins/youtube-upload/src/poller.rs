//! Status Poller: follows a freshly uploaded video through YouTube's processing.
//!
//! YouTube keeps processing a video after the last byte arrived. The poller checks its status
//! a bounded number of times on a fixed schedule and stops as soon as the status is terminal.
//! The schedule itself ([`PollState`]) is persisted, so checks survive a restart.

use crate::error::UploadError;
use crate::store::AttachmentId;
use crate::youtube_api::{UploadStatus, Video, VideoService};
use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay between upload completion and the first check.
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    pub max_checks: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay_secs: 600,
            interval_secs: 600,
            max_checks: 5,
        }
    }
}

/// The pending status check of one attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollState {
    pub attachment: AttachmentId,
    pub video_id: String,
    /// Checks performed so far.
    pub checks: u32,
    pub next_check_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Terminal(UploadStatus),
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollDecision {
    Reschedule(PollState),
    Stop(StopReason),
}

fn after(now: Timestamp, secs: u64) -> Timestamp {
    let delay = SignedDuration::from_secs(i64::try_from(secs).unwrap_or(i64::MAX));
    now.checked_add(delay).unwrap_or(Timestamp::MAX)
}

impl PollPolicy {
    pub fn first_check(
        &self,
        attachment: AttachmentId,
        video_id: impl Into<String>,
        now: Timestamp,
    ) -> PollState {
        PollState {
            attachment,
            video_id: video_id.into(),
            checks: 0,
            next_check_at: after(now, self.initial_delay_secs),
        }
    }

    /// What to do after a check observed `status` (`None` if the response had no status part).
    ///
    /// Reschedules while the status is still moving (`uploaded`, `processing`) and fewer than
    /// `max_checks` checks were made.
    pub fn decide(
        &self,
        state: &PollState,
        status: Option<UploadStatus>,
        now: Timestamp,
    ) -> PollDecision {
        let checks = state.checks + 1;
        if let Some(status) = status.filter(|s| s.is_terminal()) {
            return PollDecision::Stop(StopReason::Terminal(status));
        }
        if checks >= self.max_checks {
            return PollDecision::Stop(StopReason::BudgetExhausted);
        }
        PollDecision::Reschedule(PollState {
            checks,
            next_check_at: after(now, self.interval_secs),
            ..state.clone()
        })
    }
}

#[derive(Debug)]
pub struct StatusPoller<'a, V> {
    videos: &'a V,
}

impl<'a, V> StatusPoller<'a, V>
where
    V: VideoService,
{
    pub fn new(videos: &'a V) -> Self {
        Self { videos }
    }

    /// Fetches the current snippet and status of `video_id`.
    #[instrument(skip(self))]
    pub async fn poll(&self, video_id: &str) -> Result<Video, UploadError> {
        let video = self.videos.get_video(video_id, "snippet,status").await?;
        match video.upload_status() {
            Some(status) => tracing::debug!(%status, "polled upload status"),
            None => tracing::debug!("polled video carries no status"),
        }
        Ok(video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::FakeVideos;
    use crate::youtube_api::VideoStatus;
    use pretty_assertions::assert_eq;

    fn now() -> Timestamp {
        Timestamp::from_second(1_700_000_000).unwrap()
    }

    #[test]
    fn first_check_after_initial_delay() {
        let state = PollPolicy::default().first_check(3, "vid", now());
        assert_eq!(state.checks, 0);
        assert_eq!(state.next_check_at, after(now(), 600));
    }

    #[test]
    fn terminal_status_stops() {
        let policy = PollPolicy::default();
        let state = policy.first_check(3, "vid", now());
        for status in [
            UploadStatus::Processed,
            UploadStatus::Failed,
            UploadStatus::Rejected,
            UploadStatus::Deleted,
        ] {
            assert_eq!(
                policy.decide(&state, Some(status), now()),
                PollDecision::Stop(StopReason::Terminal(status))
            );
        }
    }

    #[test]
    fn reschedules_while_processing_up_to_the_budget() {
        let policy = PollPolicy::default();
        let mut state = policy.first_check(3, "vid", now());
        let mut checks_made = 0;
        loop {
            checks_made += 1;
            match policy.decide(&state, Some(UploadStatus::Processing), now()) {
                PollDecision::Reschedule(next) => {
                    assert_eq!(next.checks, checks_made);
                    assert_eq!(next.next_check_at, after(now(), 600));
                    state = next;
                }
                PollDecision::Stop(reason) => {
                    assert_eq!(reason, StopReason::BudgetExhausted);
                    break;
                }
            }
        }
        // a guard written as `checks > max` would never reschedule a fresh state at all
        assert_eq!(checks_made, policy.max_checks);
    }

    #[test]
    fn missing_status_keeps_polling() {
        let policy = PollPolicy::default();
        let state = policy.first_check(3, "vid", now());
        assert!(matches!(
            policy.decide(&state, None, now()),
            PollDecision::Reschedule(_)
        ));
    }

    #[tokio::test]
    async fn poll_requests_snippet_and_status() {
        let videos = FakeVideos::with(Video {
            id: "vid".into(),
            snippet: None,
            status: Some(VideoStatus {
                upload_status: UploadStatus::Processed,
                privacy_status: None,
                failure_reason: None,
                rejection_reason: None,
            }),
        });
        let video = StatusPoller::new(&videos).poll("vid").await.unwrap();
        assert_eq!(video.upload_status(), Some(UploadStatus::Processed));
        assert_eq!(videos.gets.lock().unwrap()[0].1, "snippet,status");

        let err = StatusPoller::new(&videos).poll("other").await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }
}
