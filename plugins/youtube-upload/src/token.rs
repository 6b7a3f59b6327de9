//! Access-token lifecycle: expiry tracking, refresh, and persistence.
//!
//! The [`TokenManager`] is the only piece of mutable state shared between concurrent uploads.
//! The cached token sits behind an async mutex that is held across a refresh, so callers that
//! queue up behind a refresh see the token it stored instead of starting another one.

use crate::error::{AuthError, UploadError};
use crate::store::{Store, StoredToken};
use jiff::{SignedDuration, Timestamp};
use oauth2::basic::BasicTokenResponse;
use oauth2::{AccessToken, RefreshToken, TokenResponse};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

/// Tokens are considered expired this long before the provider says they are.
const EXPIRY_BUFFER: SignedDuration = SignedDuration::from_secs(300);

/// Assumed lifetime when the provider does not send `expires_in` (one hour minus the buffer).
const DEFAULT_LIFETIME: SignedDuration = SignedDuration::from_secs(3300);

/// Exchanges a refresh token for a new access token.
///
/// [`OAuthManager`](crate::oauth::OAuthManager) is the production implementation.
pub trait TokenRefresher: Send + Sync {
    /// Returns `Ok(None)` when the provider no longer accepts `refresh_token`.
    fn refresh(
        &self,
        refresh_token: &RefreshToken,
    ) -> impl Future<Output = Result<Option<BasicTokenResponse>, UploadError>> + Send;
}

#[derive(Debug, Clone)]
pub struct TimeBoundAccessToken {
    access_token: AccessToken,
    refresh_token: Option<RefreshToken>,
    /// When the current access token expires (with safety buffer)
    expires_at: Timestamp,
}

impl TimeBoundAccessToken {
    /// Creates a token with its expiry computed from the response's `expires_in`.
    pub fn new(token: &BasicTokenResponse) -> Self {
        Self {
            access_token: token.access_token().clone(),
            refresh_token: token.refresh_token().cloned(),
            expires_at: Self::calculate_token_expiry(token, Timestamp::now()),
        }
    }

    /// Creates a token that is already expired, forcing a refresh before first use.
    pub fn expired(token: &BasicTokenResponse) -> Self {
        Self {
            expires_at: Timestamp::UNIX_EPOCH,
            ..Self::new(token)
        }
    }

    pub fn from_stored(stored: &StoredToken) -> Self {
        Self {
            access_token: AccessToken::new(stored.access_token.clone()),
            refresh_token: stored.refresh_token.clone().map(RefreshToken::new),
            expires_at: stored.expires_at,
        }
    }

    pub fn to_stored(&self) -> StoredToken {
        StoredToken {
            access_token: self.access_token.secret().clone(),
            refresh_token: self.refresh_token.as_ref().map(|t| t.secret().clone()),
            expires_at: self.expires_at,
        }
    }

    pub fn refresh_token(&self) -> Option<&RefreshToken> {
        self.refresh_token.as_ref()
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// The token that results from `response`, keeping our refresh token if the response
    /// does not carry a new one.
    fn succeeded_by(&self, response: &BasicTokenResponse) -> Self {
        let mut next = Self::new(response);
        if next.refresh_token.is_none() {
            tracing::trace!("new token lacks refresh token, keeping the previous one");
            next.refresh_token = self.refresh_token.clone();
        } else {
            tracing::debug!("new token includes refresh token");
        }
        next
    }

    fn calculate_token_expiry(token: &BasicTokenResponse, now: Timestamp) -> Timestamp {
        let lifetime = match token.expires_in() {
            Some(expires_in) => {
                SignedDuration::try_from(expires_in).unwrap_or(DEFAULT_LIFETIME) - EXPIRY_BUFFER
            }
            None => DEFAULT_LIFETIME,
        };
        now.checked_add(lifetime).unwrap_or(Timestamp::MAX)
    }
}

/// An access token handed out for one request, with the refresh generation it came from.
#[derive(Clone)]
pub struct BearerToken {
    pub secret: String,
    /// Pass back to [`TokenManager::force_refresh`] if the API rejects this token.
    pub generation: u64,
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("secret", &"[redacted]")
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug)]
struct TokenState {
    token: Option<TimeBoundAccessToken>,
    /// Bumped on every successful refresh or install.
    generation: u64,
}

#[derive(Debug)]
pub struct TokenManager<R, S> {
    state: Mutex<TokenState>,
    refresher: R,
    store: Arc<S>,
}

impl<R, S> TokenManager<R, S>
where
    R: TokenRefresher,
    S: Store,
{
    pub fn new(refresher: R, store: Arc<S>, token: Option<TimeBoundAccessToken>) -> Self {
        Self {
            state: Mutex::new(TokenState {
                token,
                generation: 0,
            }),
            refresher,
            store,
        }
    }

    /// Creates a manager seeded with whatever token the store holds.
    pub async fn load(refresher: R, store: Arc<S>) -> Result<Self, UploadError> {
        let stored = store.load_token().await?;
        let token = stored.as_ref().map(TimeBoundAccessToken::from_stored);
        Ok(Self::new(refresher, store, token))
    }

    /// Installs the result of the interactive consent flow.
    ///
    /// Google only returns a refresh token on the first consent; a response without one keeps
    /// the refresh token we already had.
    pub async fn install(&self, response: &BasicTokenResponse) -> Result<(), UploadError> {
        let mut state = self.state.lock().await;
        let next = match &state.token {
            Some(current) => current.succeeded_by(response),
            None => TimeBoundAccessToken::new(response),
        };
        if next.refresh_token.is_none() {
            tracing::warn!("consent response carried no refresh token; access will lapse");
        }
        self.store.save_token(&next.to_stored()).await?;
        state.token = Some(next);
        state.generation += 1;
        Ok(())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state
            .lock()
            .await
            .token
            .as_ref()
            .is_some_and(|t| t.refresh_token.is_some())
    }

    /// Returns a valid access token, refreshing (and persisting) it if it has expired.
    #[instrument(skip(self))]
    pub async fn access_token(&self) -> Result<BearerToken, UploadError> {
        let mut state = self.state.lock().await;
        let now = Timestamp::now();
        match &state.token {
            None => return Err(AuthError::NotAuthenticated.into()),
            Some(token) if !token.is_expired_at(now) => {
                return Ok(BearerToken {
                    secret: token.access_token.secret().clone(),
                    generation: state.generation,
                });
            }
            Some(_) => {
                tracing::debug!("access token expired, attempting refresh");
            }
        }
        self.refresh_locked(&mut state).await
    }

    /// Refreshes unconditionally, unless another caller already refreshed since
    /// `observed_generation`, in which case that caller's token is returned.
    #[instrument(skip(self))]
    pub async fn force_refresh(&self, observed_generation: u64) -> Result<BearerToken, UploadError> {
        let mut state = self.state.lock().await;
        if state.generation != observed_generation {
            if let Some(token) = &state.token {
                tracing::debug!("token was refreshed concurrently, reusing it");
                return Ok(BearerToken {
                    secret: token.access_token.secret().clone(),
                    generation: state.generation,
                });
            }
        }
        self.refresh_locked(&mut state).await
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<BearerToken, UploadError> {
        let Some(current) = state.token.as_ref() else {
            return Err(AuthError::NotAuthenticated.into());
        };
        let Some(refresh_token) = current.refresh_token.clone() else {
            tracing::warn!("no refresh token available, cannot refresh");
            return Err(AuthError::NotAuthenticated.into());
        };

        let Some(response) = self.refresher.refresh(&refresh_token).await? else {
            // the stored refresh token stays put; only a new consent replaces it
            tracing::error!("access token refresh failed, re-authentication required");
            return Err(AuthError::RefreshRejected.into());
        };

        let next = current.succeeded_by(&response);
        self.store.save_token(&next.to_stored()).await?;
        let secret = next.access_token.secret().clone();
        state.token = Some(next);
        state.generation += 1;
        tracing::debug!(generation = state.generation, "access token successfully refreshed");

        Ok(BearerToken {
            secret,
            generation: state.generation,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::poller::PollState;
    use crate::store::{AttachmentId, FileStore, ItemState};
    use oauth2::EmptyExtraTokenFields;
    use oauth2::basic::BasicTokenType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) fn token_response(
        access: &str,
        refresh: Option<&str>,
        expires_in: Duration,
    ) -> BasicTokenResponse {
        let mut response = BasicTokenResponse::new(
            AccessToken::new(access.to_string()),
            BasicTokenType::Bearer,
            EmptyExtraTokenFields {},
        );
        response.set_expires_in(Some(&expires_in));
        response.set_refresh_token(refresh.map(|r| RefreshToken::new(r.to_string())));
        response
    }

    #[derive(Default)]
    pub(crate) struct CountingRefresher {
        pub(crate) calls: AtomicUsize,
        reject: bool,
    }

    impl TokenRefresher for CountingRefresher {
        async fn refresh(
            &self,
            _refresh_token: &RefreshToken,
        ) -> Result<Option<BasicTokenResponse>, UploadError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            // give a concurrent caller the chance to race us
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.reject {
                return Ok(None);
            }
            Ok(Some(token_response(
                &format!("access-{n}"),
                None,
                Duration::from_secs(3600),
            )))
        }
    }

    #[derive(Debug, Default)]
    struct CountingStore {
        inner: FileStore,
        saves: AtomicUsize,
    }

    impl Store for CountingStore {
        async fn load_token(&self) -> Result<Option<StoredToken>, StoreError> {
            self.inner.load_token().await
        }

        async fn save_token(&self, token: &StoredToken) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save_token(token).await
        }

        async fn item(&self, id: AttachmentId) -> Result<ItemState, StoreError> {
            self.inner.item(id).await
        }

        async fn update_item<F, T>(&self, id: AttachmentId, f: F) -> Result<T, StoreError>
        where
            F: FnOnce(&mut ItemState) -> T + Send,
            T: Send,
        {
            self.inner.update_item(id, f).await
        }

        async fn items_with_pending_polls(&self) -> Result<Vec<PollState>, StoreError> {
            self.inner.items_with_pending_polls().await
        }
    }

    fn expired_with_refresh() -> TimeBoundAccessToken {
        TimeBoundAccessToken::expired(&token_response(
            "stale",
            Some("1//refresh"),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test]
    async fn fresh_token_is_returned_as_is() {
        let store = Arc::new(CountingStore::default());
        let token = TimeBoundAccessToken::new(&token_response(
            "fresh",
            Some("1//refresh"),
            Duration::from_secs(3600),
        ));
        let manager = TokenManager::new(CountingRefresher::default(), store.clone(), Some(token));

        let bearer = manager.access_token().await.unwrap();
        assert_eq!(bearer.secret, "fresh");
        assert_eq!(bearer.generation, 0);
        assert_eq!(manager.refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_refresh_token_is_not_authenticated() {
        let store = Arc::new(CountingStore::default());
        let manager = TokenManager::new(CountingRefresher::default(), store.clone(), None);
        assert!(matches!(
            manager.access_token().await,
            Err(UploadError::Auth(AuthError::NotAuthenticated))
        ));

        let no_refresh =
            TimeBoundAccessToken::expired(&token_response("stale", None, Duration::from_secs(60)));
        let manager = TokenManager::new(CountingRefresher::default(), store, Some(no_refresh));
        assert!(!manager.is_authenticated().await);
        assert!(matches!(
            manager.access_token().await,
            Err(UploadError::Auth(AuthError::NotAuthenticated))
        ));
    }

    #[tokio::test]
    async fn refresh_persists_and_keeps_refresh_token() {
        let store = Arc::new(CountingStore::default());
        let manager = TokenManager::new(
            CountingRefresher::default(),
            store.clone(),
            Some(expired_with_refresh()),
        );

        let bearer = manager.access_token().await.unwrap();
        assert_eq!(bearer.secret, "access-1");
        assert_eq!(bearer.generation, 1);

        let stored = store.load_token().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access-1");
        assert_eq!(stored.refresh_token.as_deref(), Some("1//refresh"));
        assert!(stored.expires_at > Timestamp::now());
    }

    #[tokio::test]
    async fn concurrent_refreshes_happen_once() {
        let store = Arc::new(CountingStore::default());
        let manager = TokenManager::new(
            CountingRefresher::default(),
            store.clone(),
            Some(expired_with_refresh()),
        );

        let (a, b) = tokio::join!(manager.access_token(), manager.access_token());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.secret, b.secret);
        assert_eq!(manager.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_refresh_is_compare_and_set() {
        let store = Arc::new(CountingStore::default());
        let token = TimeBoundAccessToken::new(&token_response(
            "rejected-by-api",
            Some("1//refresh"),
            Duration::from_secs(3600),
        ));
        let manager = TokenManager::new(CountingRefresher::default(), store.clone(), Some(token));
        let observed = manager.access_token().await.unwrap().generation;

        // two requests got a 401 with the same token
        let (a, b) = tokio::join!(
            manager.force_refresh(observed),
            manager.force_refresh(observed)
        );
        assert_eq!(a.unwrap().secret, "access-1");
        assert_eq!(b.unwrap().secret, "access-1");
        assert_eq!(manager.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_keeps_refresh_token() {
        let store = Arc::new(CountingStore::default());
        let refresher = CountingRefresher {
            reject: true,
            ..CountingRefresher::default()
        };
        let manager = TokenManager::new(refresher, store.clone(), Some(expired_with_refresh()));

        assert!(matches!(
            manager.access_token().await,
            Err(UploadError::Auth(AuthError::RefreshRejected))
        ));
        assert!(manager.is_authenticated().await);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn install_preserves_previous_refresh_token() {
        let store = Arc::new(CountingStore::default());
        let manager = TokenManager::new(
            CountingRefresher::default(),
            store.clone(),
            Some(expired_with_refresh()),
        );
        manager
            .install(&token_response("consented", None, Duration::from_secs(3600)))
            .await
            .unwrap();

        let stored = store.load_token().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "consented");
        assert_eq!(stored.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(manager.access_token().await.unwrap().secret, "consented");
    }
}
