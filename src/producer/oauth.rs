//! OAuth2 token acquisition/refresh. Thin adapter: the wire-level protocol
//! details are out of scope for the core, but the CLI contract (`--auth-setup`)
//! and the XOAUTH2 SASL string the IMAP adapter needs are specified here.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, PkceCodeChallenge, RedirectUrl,
    RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tiny_http::{Response, Server};
use tracing::{info, warn};
use url::Url;

use crate::core::config::Provider;
use crate::core::constants::{DEFAULT_OAUTH_REDIRECT_URI, OAUTH_CALLBACK_TIMEOUT_SECS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StoredToken {
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(exp) => exp > chrono::Utc::now() + chrono::Duration::seconds(60),
            None => false,
        }
    }
}

pub struct OAuth2Manager {
    client: BasicClient,
    provider: Provider,
    token_file: PathBuf,
}

impl OAuth2Manager {
    pub fn new(provider: Provider, client_id: String, client_secret: String, token_file: PathBuf) -> Result<Self> {
        let client = BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            AuthUrl::new(provider.oauth_auth_uri().to_string())?,
            Some(TokenUrl::new(provider.oauth_token_uri().to_string())?),
        );
        Ok(Self {
            client,
            provider,
            token_file,
        })
    }

    pub fn token_file(&self) -> &PathBuf {
        &self.token_file
    }

    fn load_cached(&self) -> Option<StoredToken> {
        let raw = std::fs::read_to_string(&self.token_file).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn persist(&self, token: &StoredToken) -> Result<()> {
        if let Some(parent) = self.token_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.token_file, serde_json::to_string_pretty(token)?)
            .with_context(|| format!("writing token file {}", self.token_file.display()))
    }

    pub fn is_token_valid(&self) -> bool {
        self.load_cached().map(|t| t.is_valid()).unwrap_or(false)
    }

    /// Refreshes the cached token via its refresh token, or runs the
    /// interactive authorization-code flow if `force_reauth` is set or no
    /// usable token exists.
    pub async fn authenticate(&self, force_reauth: bool) -> Result<StoredToken> {
        if !force_reauth {
            if let Some(cached) = self.load_cached() {
                if cached.is_valid() {
                    return Ok(cached);
                }
                if let Some(refresh) = cached.refresh_token.clone() {
                    if let Ok(refreshed) = self.refresh(&refresh).await {
                        self.persist(&refreshed)?;
                        return Ok(refreshed);
                    }
                }
            }
        }
        let token = self.run_authorization_flow().await?;
        self.persist(&token)?;
        Ok(token)
    }

    /// Runs the authorization-code + PKCE flow end to end: opens the
    /// system browser on the provider's consent screen, listens on a local
    /// loopback HTTP server for the redirect, and exchanges the resulting
    /// code for tokens.
    async fn run_authorization_flow(&self) -> Result<StoredToken> {
        let redirect_uri = DEFAULT_OAUTH_REDIRECT_URI;
        let client = self
            .client
            .clone()
            .set_redirect_uri(RedirectUrl::new(redirect_uri.to_string())?);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, _csrf_token) = client
            .authorize_url(oauth2::CsrfToken::new_random)
            .add_scope(Scope::new(self.provider.oauth_scope().to_string()))
            .set_pkce_challenge(pkce_challenge)
            .url();

        info!(url = %auth_url, "open this URL in your browser to authorize");
        if let Err(e) = open::that(auth_url.as_str()) {
            warn!(error = %e, "could not open browser automatically, open the URL manually");
        }

        let redirect_uri_owned = redirect_uri.to_string();
        let code = tokio::task::spawn_blocking(move || wait_for_authorization_code(&redirect_uri_owned))
            .await
            .context("authorization callback listener task panicked")??;

        let token_result = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| anyhow!("token exchange failed: {e}"))?;

        Ok(StoredToken {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result.refresh_token().map(|t| t.secret().clone()),
            expires_at: token_result
                .expires_in()
                .map(|d| chrono::Utc::now() + chrono::Duration::from_std(d).unwrap_or_default()),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<StoredToken> {
        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|e| anyhow!("token refresh failed: {e}"))?;

        Ok(StoredToken {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result
                .refresh_token()
                .map(|t| t.secret().clone())
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: token_result
                .expires_in()
                .map(|d| chrono::Utc::now() + chrono::Duration::from_std(d).unwrap_or_default()),
        })
    }

    /// Builds the XOAUTH2 SASL initial-response string consumed by the IMAP
    /// adapter's `AUTHENTICATE XOAUTH2` exchange.
    pub fn xoauth2_string(user: &str, access_token: &str) -> String {
        format!("user={user}\x01auth=Bearer {access_token}\x01\x01")
    }
}

/// Blocks the calling thread on a local HTTP listener until the provider
/// redirects back with `?code=...`, or the timeout elapses. Run inside
/// `spawn_blocking` since `tiny_http` has no async API.
fn wait_for_authorization_code(redirect_uri: &str) -> Result<String> {
    let parsed = Url::parse(redirect_uri).map_err(|e| anyhow!("invalid redirect uri '{redirect_uri}': {e}"))?;
    let host = parsed.host_str().ok_or_else(|| anyhow!("redirect uri missing host: {redirect_uri}"))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| anyhow!("redirect uri missing port: {redirect_uri}"))?;

    let bind_ip: IpAddr = match host {
        "localhost" | "127.0.0.1" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other
            .parse()
            .map_err(|_| anyhow!("redirect uri host must be localhost or an IP: {other}"))?,
    };
    let bind_addr = SocketAddr::new(bind_ip, port);

    let server = Server::http(bind_addr)
        .map_err(|e| anyhow!("failed to bind oauth callback server on {bind_addr}: {e:?}"))?;
    let deadline = Instant::now() + Duration::from_secs(OAUTH_CALLBACK_TIMEOUT_SECS);

    while Instant::now() < deadline {
        let Ok(Some(request)) = server.recv_timeout(Duration::from_millis(500)) else {
            continue;
        };

        let full = format!("http://{host}:{port}{}", request.url());
        let Ok(callback_url) = Url::parse(&full) else {
            let _ = request.respond(Response::from_string("bad redirect"));
            continue;
        };

        if let Some((_, code)) = callback_url.query_pairs().find(|(k, _)| k == "code") {
            let code = code.into_owned();
            let _ = request.respond(Response::from_string("Authorization received. You can close this tab."));
            return Ok(code);
        }
        let _ = request.respond(Response::from_string("No code found in redirect. You can close this tab."));
    }

    Err(anyhow!("no authorization code received within {OAUTH_CALLBACK_TIMEOUT_SECS}s"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_string_matches_sasl_shape() {
        let s = OAuth2Manager::xoauth2_string("me@example.com", "tok");
        assert_eq!(s, "user=me@example.com\x01auth=Bearer tok\x01\x01");
    }

    #[test]
    fn token_without_expiry_is_invalid() {
        let token = StoredToken {
            access_token: "x".into(),
            refresh_token: None,
            expires_at: None,
        };
        assert!(!token.is_valid());
    }

    #[test]
    fn token_expiring_soon_is_invalid() {
        let token = StoredToken {
            access_token: "x".into(),
            refresh_token: None,
            expires_at: Some(chrono::Utc::now() + chrono::Duration::seconds(10)),
        };
        assert!(!token.is_valid());
    }
}
