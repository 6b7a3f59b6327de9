//! OAuth 2.0 management for YouTube API authentication.
//!
//! This module encapsulates the authorization-code grant (with PKCE) used to obtain the first
//! refresh token, and the refresh exchange the [`TokenManager`](crate::token::TokenManager)
//! uses afterwards.

use crate::config::{Endpoints, Settings};
use crate::error::{AuthError, UploadError};
use crate::token::TokenRefresher;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, body};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::url::{Host, Url};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, RevocationUrl, Scope,
    TokenUrl, reqwest,
};
use std::future::Future;

/// Scopes requested during consent: manage, upload, and read back videos.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/youtube",
    "https://www.googleapis.com/auth/youtube.upload",
    "https://www.googleapis.com/auth/youtube.readonly",
];

const OAUTH_DONE_HTML: &str = "<!doctype html><html><body>\
    <h1>YouTube access granted</h1>\
    <p>You can close this window and return to the terminal.</p>\
    </body></html>";

/// An authorization URL waiting for the resource owner to come back with a code.
#[derive(Debug)]
pub struct PendingAuthorization {
    /// Where to send the resource owner.
    pub url: Url,
    /// The anti-forgery `state` the callback must echo.
    pub csrf: CsrfToken,
    pub pkce_verifier: PkceCodeVerifier,
    pub redirect_url: RedirectUrl,
}

/// Manages OAuth 2.0 authentication flows for YouTube API access.
///
/// Holds the client credentials and endpoint URLs, and hands out the authorization URL,
/// the code exchange, and the refresh exchange.
#[derive(Debug, Clone)]
pub struct OAuthManager {
    client_id: String,
    client_secret: String,
    redirect_uri: Option<String>,
    endpoints: Endpoints,
    http_client: reqwest::Client,
}

impl OAuthManager {
    pub fn new(settings: &Settings) -> Result<Self, UploadError> {
        settings.require_client()?;
        let http_client = reqwest::ClientBuilder::new()
            // SSRF no thank you.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UploadError::Config(format!("build OAuth HTTP client: {e}")))?;
        Ok(Self {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            redirect_uri: settings.redirect_uri.clone(),
            endpoints: settings.endpoints.clone(),
            http_client,
        })
    }

    fn token_url(&self) -> Result<TokenUrl, UploadError> {
        TokenUrl::new(self.endpoints.token_url.clone())
            .map_err(|e| UploadError::Config(format!("invalid token endpoint URL: {e}")))
    }

    /// Builds the consent URL for the given redirect and anti-forgery token.
    ///
    /// Asks for offline access and forces the consent prompt so that Google hands out a
    /// refresh token even if the user has granted access before.
    pub fn authorize_url(
        &self,
        redirect_url: RedirectUrl,
        csrf: CsrfToken,
    ) -> Result<PendingAuthorization, UploadError> {
        let auth_url = AuthUrl::new(self.endpoints.auth_url.clone())
            .map_err(|e| UploadError::Config(format!("invalid authorization endpoint URL: {e}")))?;
        let revocation_url = RevocationUrl::new(self.endpoints.revocation_url.clone())
            .map_err(|e| UploadError::Config(format!("invalid revocation endpoint URL: {e}")))?;
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(self.token_url()?)
            .set_redirect_uri(redirect_url.clone())
            .set_revocation_url(revocation_url);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let state = csrf.clone();
        let (url, csrf) = client
            .authorize_url(move || state)
            .add_scopes(SCOPES.iter().map(|s| Scope::new(s.to_string())))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(pkce_challenge)
            .url();

        Ok(PendingAuthorization {
            url,
            csrf,
            pkce_verifier,
            redirect_url,
        })
    }

    /// Exchanges the code from the callback for `{access_token, refresh_token, expires_in}`.
    pub async fn exchange_code(
        &self,
        pending: PendingAuthorization,
        code: AuthorizationCode,
    ) -> Result<BasicTokenResponse, UploadError> {
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_token_uri(self.token_url()?)
            .set_redirect_uri(pending.redirect_url);

        client
            .exchange_code(code)
            .set_pkce_verifier(pending.pkce_verifier)
            .request_async(&self.http_client)
            .await
            .map_err(|e| match e {
                RequestTokenError::Request(e) => UploadError::Transient(e.to_string()),
                e => AuthError::Flow(format!("exchange authorization code: {e}")).into(),
            })
    }

    /// Performs a complete OAuth 2.0 authorization flow to obtain a new token.
    ///
    /// This method:
    /// 1. Starts a one-shot loopback HTTP server on the configured redirect URI (or a random
    ///    local port) to receive the callback
    /// 2. Opens the user's browser on the consent page
    /// 3. Validates the returned `state` and exchanges the code for tokens
    pub async fn authenticate(&self) -> Result<BasicTokenResponse, UploadError> {
        let csrf = CsrfToken::new_random();
        let (redirect_url, eventually_authorization_code) =
            self.setup_redirect(csrf.clone()).await?;
        let pending = self.authorize_url(redirect_url, csrf)?;

        tracing::info!(url = %pending.url, "asking user to follow OAuth flow");
        webbrowser::open(pending.url.as_str())
            .map_err(|e| AuthError::Flow(format!("open user's browser: {e}")))?;
        let authorization_code = eventually_authorization_code.await?;

        self.exchange_code(pending, authorization_code).await
    }

    /// Picks the address to listen on for the OAuth callback.
    ///
    /// A configured redirect URI must be a loopback `http` URL since the callback is served by
    /// this process.
    fn redirect_bind(&self) -> Result<(String, u16, Option<Url>), UploadError> {
        let Some(raw) = &self.redirect_uri else {
            return Ok(("127.0.0.1".to_string(), 0, None));
        };
        let url = Url::parse(raw)
            .map_err(|e| UploadError::Config(format!("invalid redirect_uri {raw}: {e}")))?;
        if url.scheme() != "http" {
            return Err(UploadError::Config(format!(
                "redirect_uri {raw} must use http for the loopback flow"
            )));
        }
        let host = match url.host() {
            Some(Host::Ipv4(ip)) if ip.is_loopback() => ip.to_string(),
            Some(Host::Ipv6(ip)) if ip.is_loopback() => ip.to_string(),
            Some(Host::Domain("localhost")) => "localhost".to_string(),
            _ => {
                return Err(UploadError::Config(format!(
                    "redirect_uri {raw} must point at a loopback address"
                )));
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);
        Ok((host, port, Some(url)))
    }

    /// Sets up a local HTTP server to receive the OAuth authorization callback.
    ///
    /// The server validates the CSRF token and extracts the authorization code from the
    /// callback.
    ///
    /// # Returns
    ///
    /// A tuple containing:
    /// - The redirect URL to use in the OAuth flow
    /// - A future that resolves to the authorization code when the callback is received
    async fn setup_redirect(
        &self,
        csrf: CsrfToken,
    ) -> Result<
        (
            RedirectUrl,
            impl Future<Output = Result<AuthorizationCode, UploadError>>,
        ),
        UploadError,
    > {
        let (host, port, configured) = self.redirect_bind()?;
        let socket = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
        let addr = socket.local_addr()?;
        // keep the configured URI byte-for-byte, it has to match the registered one
        let url = match (configured, &self.redirect_uri) {
            (Some(_), Some(raw)) => raw.clone(),
            _ => format!("http://{}:{}", addr.ip(), addr.port()),
        };
        let url = RedirectUrl::new(url)
            .map_err(|e| UploadError::Config(format!("construct redirect url: {e}")))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let r = async move {
                let (conn, _) = socket.accept().await?;
                let conn = hyper_util::rt::TokioIo::new(conn);
                let (got, mut gotten) = tokio::sync::mpsc::channel(1);
                let service = service_fn(move |req: Request<body::Incoming>| {
                    let csrf = csrf.clone();
                    let got = got.clone();
                    async move {
                        let mut presented_state = None;
                        let mut presented_code = None;
                        let mut presented_error = None;
                        for (k, v) in
                            form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
                        {
                            match &*k {
                                "state" => presented_state = Some(v),
                                "code" => presented_code = Some(v),
                                "error" => presented_error = Some(v),
                                _ => {}
                            }
                        }
                        if presented_state.as_deref() != Some(csrf.secret().as_str()) {
                            return Err("invalid csrf token");
                        }
                        let outcome = match (presented_code, presented_error) {
                            (Some(code), _) => Ok(AuthorizationCode::new(code.into_owned())),
                            (None, Some(error)) => Err(error.into_owned()),
                            (None, None) => Err("no authorization code found".to_string()),
                        };
                        let page = if outcome.is_ok() {
                            OAUTH_DONE_HTML
                        } else {
                            "<!doctype html><html><body><h1>YouTube access was not granted</h1></body></html>"
                        };
                        // the receiver only goes away once we have answered
                        let _ = got.send(outcome).await;
                        Ok(Response::new(Full::<Bytes>::from(page)))
                    }
                });
                let mut serve = std::pin::pin!(
                    hyper::server::conn::http1::Builder::new().serve_connection(conn, service)
                );

                let flow_error = |msg: String| UploadError::Auth(AuthError::Flow(msg));
                tokio::select! {
                    exit = &mut serve => {
                        match exit {
                            Err(e) => Err(flow_error(format!("redirect server got bad request: {e}"))),
                            Ok(()) => Err(flow_error("redirect server exit prematurely".into())),
                        }
                    }
                    outcome = gotten.recv() => {
                        serve.as_mut().graceful_shutdown();
                        // let the response page reach the browser
                        let _ = serve.await;
                        match outcome {
                            Some(Ok(code)) => Ok(code),
                            Some(Err(error)) => Err(flow_error(format!("authorization denied: {error}"))),
                            None => Err(flow_error("redirect handler dropped".into())),
                        }
                    }
                }
            };
            let r: Result<AuthorizationCode, UploadError> = r.await;
            let _ = tx.send(r);
        });
        Ok((url, async move {
            rx.await
                .map_err(|_| AuthError::Flow("redirect future dropped prematurely".into()))?
        }))
    }
}

impl TokenRefresher for OAuthManager {
    /// Exchanges `refresh_token` for a fresh access token.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(new_token))` - Refresh succeeded
    /// * `Ok(None)` - The identity provider no longer accepts the refresh token
    /// * `Err(_)` - Network or other error occurred during the refresh attempt
    async fn refresh(
        &self,
        refresh_token: &RefreshToken,
    ) -> Result<Option<BasicTokenResponse>, UploadError> {
        tracing::debug!("attempting to refresh OAuth token");

        // Create a minimal OAuth client for token refresh (no redirect URL needed)
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_token_uri(self.token_url()?);

        match client
            .exchange_refresh_token(refresh_token)
            .request_async(&self.http_client)
            .await
        {
            Ok(new_token) => {
                tracing::debug!("successfully refreshed OAuth token");
                Ok(Some(new_token))
            }
            Err(ref e @ RequestTokenError::ServerResponse(ref sr))
                if matches!(
                    sr.error(),
                    oauth2::basic::BasicErrorResponseType::InvalidGrant
                ) =>
            {
                tracing::warn!("OAuth refresh token considered invalid grant: {}", e);
                Ok(None)
            }
            Err(RequestTokenError::Request(e)) => Err(UploadError::Transient(format!(
                "exchange refresh token: {e}"
            ))),
            Err(e) => Err(AuthError::Flow(format!("exchange refresh token: {e}")).into()),
        }
    }
}
