//! Clients for the two external services Anicord talks to: Discord (OAuth,
//! identity, role connections) and AniList (OAuth + GraphQL statistics).

use std::fmt;
use std::sync::Arc;

use anicord_core::{
    DiscordId, PlatformSession, PlatformUser, RoleConnectionMetadata, RoleConnectionUpdate,
    Statistics, TokenPair, PLATFORM_SCOPES,
};
use anicord_storage::RateLimiter;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeDelta, Utc};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "anicord-adapters";

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
pub const DISCORD_AUTHORIZE_URL: &str = "https://discord.com/oauth2/authorize";
pub const ANILIST_GRAPHQL_ENDPOINT: &str = "https://graphql.anilist.co";
pub const ANILIST_AUTHORIZE_URL: &str = "https://anilist.co/api/v2/oauth/authorize";
pub const ANILIST_TOKEN_URL: &str = "https://anilist.co/api/v2/oauth/token";

/// Name shown next to the linked role on Discord profiles.
pub const PLATFORM_NAME: &str = "AniList";

pub const VIEWER_STATISTICS_QUERY: &str = include_str!("../queries/viewer_statistics.graphql");

/// Error message AniList returns for revoked or expired bearer tokens. AniList
/// has no structured error code for this, so matching relies on the exact text.
pub const INVALID_TOKEN_MESSAGE: &str = "Invalid token";

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("discord rejected the credential")]
    Unauthorized,
    #[error("discord returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("discord request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid discord response: {0}")]
    InvalidResponse(String),
}

/// The subset of the Discord API Anicord depends on.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Consent screen URL for the `identify` and `role_connections.write` scopes.
    fn authorization_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<TokenPair, PlatformError>;

    /// Trade the session's refresh token for a new token pair. A revoked grant
    /// surfaces as [`PlatformError::Unauthorized`].
    async fn refresh_session(
        &self,
        session: &dyn PlatformSession,
    ) -> Result<TokenPair, PlatformError>;

    async fn current_user(&self, session: &dyn PlatformSession)
        -> Result<PlatformUser, PlatformError>;

    async fn update_role_connection(
        &self,
        session: &dyn PlatformSession,
        update: &RoleConnectionUpdate,
    ) -> Result<(), PlatformError>;

    /// Declare the application's role-connection metadata fields.
    async fn register_metadata(&self, fields: &[RoleConnectionMetadata])
        -> Result<(), PlatformError>;
}

#[derive(Clone)]
pub struct DiscordConfig {
    pub application_id: u64,
    pub client_secret: String,
    pub bot_token: String,
    pub redirect_uri: String,
    pub api_base: String,
    pub authorize_url: String,
}

impl DiscordConfig {
    pub fn new(
        application_id: u64,
        client_secret: impl Into<String>,
        bot_token: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            application_id,
            client_secret: client_secret.into(),
            bot_token: bot_token.into(),
            redirect_uri: redirect_uri.into(),
            api_base: DISCORD_API_BASE.to_string(),
            authorize_url: DISCORD_AUTHORIZE_URL.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

impl fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("application_id", &self.application_id)
            .field("client_secret", &"[redacted]")
            .field("bot_token", &"[redacted]")
            .field("redirect_uri", &self.redirect_uri)
            .field("api_base", &self.api_base)
            .field("authorize_url", &self.authorize_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    config: DiscordConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    /// Fails when `expires_in` is negative or puts the expiry outside the
    /// representable range.
    fn into_pair(
        self,
        issued_at: DateTime<Utc>,
        previous_refresh: &str,
    ) -> Result<TokenPair, String> {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expiry = (expires_in >= 0)
            .then(|| TimeDelta::try_seconds(expires_in))
            .flatten()
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| format!("unusable expires_in {expires_in}"))?;
        Ok(TokenPair {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .unwrap_or_else(|| previous_refresh.to_string()),
            expiry,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct DiscordUserResponse {
    id: String,
    username: String,
}

fn with_query(base: &str, pairs: &[(&str, &str)]) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{base}?{query}")
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(PlatformError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PlatformError::Status {
        status: status.as_u16(),
        body,
    })
}

impl DiscordClient {
    pub fn new(http: reqwest::Client, config: DiscordConfig) -> Self {
        Self { http, config }
    }

    pub fn application_id(&self) -> u64 {
        self.config.application_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        previous_refresh: &str,
    ) -> Result<TokenPair, PlatformError> {
        let client_id = self.config.application_id.to_string();
        let mut params = vec![
            ("client_id", client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        params.extend_from_slice(form);

        let response = self
            .http
            .post(self.endpoint("/oauth2/token"))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<OAuthErrorBody>(&body) {
                Ok(err) if err.error == "invalid_grant" => Err(PlatformError::Unauthorized),
                _ => Err(PlatformError::Status {
                    status: status.as_u16(),
                    body,
                }),
            };
        }

        let token: TokenResponse = ensure_success(response).await?.json().await?;
        token
            .into_pair(Utc::now(), previous_refresh)
            .map_err(PlatformError::InvalidResponse)
    }
}

#[async_trait]
impl PlatformApi for DiscordClient {
    fn authorization_url(&self, state: &str) -> String {
        let client_id = self.config.application_id.to_string();
        let scope = PLATFORM_SCOPES.join(" ");
        with_query(
            &self.config.authorize_url,
            &[
                ("client_id", client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state),
                ("prompt", "consent"),
            ],
        )
    }

    #[tracing::instrument(name = "discord.exchange_code", skip_all, err)]
    async fn exchange_code(&self, code: &str) -> Result<TokenPair, PlatformError> {
        self.token_request(
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ],
            "",
        )
        .await
    }

    #[tracing::instrument(name = "discord.refresh_session", skip_all, err)]
    async fn refresh_session(
        &self,
        session: &dyn PlatformSession,
    ) -> Result<TokenPair, PlatformError> {
        self.token_request(
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", session.refresh_token()),
            ],
            session.refresh_token(),
        )
        .await
    }

    #[tracing::instrument(name = "discord.current_user", skip_all, err)]
    async fn current_user(
        &self,
        session: &dyn PlatformSession,
    ) -> Result<PlatformUser, PlatformError> {
        let response = self
            .http
            .get(self.endpoint("/users/@me"))
            .bearer_auth(session.access_token())
            .send()
            .await?;
        let user: DiscordUserResponse = ensure_success(response).await?.json().await?;
        let id = user
            .id
            .parse::<DiscordId>()
            .map_err(|err| {
                PlatformError::InvalidResponse(format!("user id {:?}: {err}", user.id))
            })?;
        Ok(PlatformUser {
            id,
            username: user.username,
        })
    }

    #[tracing::instrument(name = "discord.update_role_connection", skip_all, err)]
    async fn update_role_connection(
        &self,
        session: &dyn PlatformSession,
        update: &RoleConnectionUpdate,
    ) -> Result<(), PlatformError> {
        let path = format!(
            "/users/@me/applications/{}/role-connection",
            self.config.application_id
        );
        let response = self
            .http
            .put(self.endpoint(&path))
            .bearer_auth(session.access_token())
            .json(update)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    #[tracing::instrument(name = "discord.register_metadata", skip_all, err)]
    async fn register_metadata(
        &self,
        fields: &[RoleConnectionMetadata],
    ) -> Result<(), PlatformError> {
        let path = format!(
            "/applications/{}/role-connections/metadata",
            self.config.application_id
        );
        let response = self
            .http
            .put(self.endpoint(&path))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bot {}", self.config.bot_token),
            )
            .json(fields)
            .send()
            .await?;
        ensure_success(response).await?;
        debug!(fields = fields.len(), "registered role connection metadata");
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StatisticsError {
    #[error("anilist rejected the credential")]
    InvalidCredential,
    #[error("anilist reported errors: {0}")]
    Upstream(String),
    #[error("anilist request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("anilist response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("anilist token exchange returned {status}: {body}")]
    TokenExchange { status: u16, body: String },
}

/// Source of per-user statistics, authenticated with the user's AniList grant.
#[async_trait]
pub trait StatisticsSource: Send + Sync {
    fn authorization_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<TokenPair, StatisticsError>;

    /// One rate-limited statistics query for the owner of `credential`.
    async fn fetch_statistics(&self, credential: &TokenPair)
        -> Result<Statistics, StatisticsError>;
}

#[derive(Clone)]
pub struct AniListConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub graphql_endpoint: String,
    pub authorize_url: String,
    pub token_url: String,
}

impl AniListConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            graphql_endpoint: ANILIST_GRAPHQL_ENDPOINT.to_string(),
            authorize_url: ANILIST_AUTHORIZE_URL.to_string(),
            token_url: ANILIST_TOKEN_URL.to_string(),
        }
    }
}

impl fmt::Debug for AniListConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AniListConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("redirect_uri", &self.redirect_uri)
            .field("graphql_endpoint", &self.graphql_endpoint)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AniListClient {
    http: reqwest::Client,
    config: AniListConfig,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    errors: Vec<GraphQlError>,
    #[serde(default)]
    data: Option<ViewerData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    #[serde(rename = "Viewer")]
    viewer: Option<Viewer>,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    name: String,
    statistics: ViewerStatistics,
}

#[derive(Debug, Deserialize)]
struct ViewerStatistics {
    anime: MediaCount,
    manga: MediaCount,
}

#[derive(Debug, Deserialize)]
struct MediaCount {
    count: u32,
}

/// Classify a GraphQL error list. A credential rejection anywhere in the list
/// wins; otherwise the messages are joined into one upstream error.
pub fn classify_graphql_errors(errors: &[GraphQlError]) -> Option<StatisticsError> {
    if errors.is_empty() {
        return None;
    }
    if errors.iter().any(|err| err.message == INVALID_TOKEN_MESSAGE) {
        return Some(StatisticsError::InvalidCredential);
    }
    let joined = errors
        .iter()
        .map(|err| match err.status {
            Some(status) => format!("{status}: {}", err.message),
            None => err.message.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ");
    Some(StatisticsError::Upstream(joined))
}

impl AniListClient {
    pub fn new(http: reqwest::Client, config: AniListConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            config,
            limiter,
        }
    }
}

#[async_trait]
impl StatisticsSource for AniListClient {
    fn authorization_url(&self, state: &str) -> String {
        with_query(
            &self.config.authorize_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("state", state),
            ],
        )
    }

    #[tracing::instrument(name = "anilist.exchange_code", skip_all, err)]
    async fn exchange_code(&self, code: &str) -> Result<TokenPair, StatisticsError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header(ACCEPT, "application/json")
            .json(&serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
                "redirect_uri": self.config.redirect_uri,
                "code": code,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StatisticsError::TokenExchange {
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse = response.json().await?;
        token
            .into_pair(Utc::now(), "")
            .map_err(|body| StatisticsError::TokenExchange {
                status: status.as_u16(),
                body,
            })
    }

    #[tracing::instrument(name = "anilist.fetch_statistics", skip_all, err)]
    async fn fetch_statistics(
        &self,
        credential: &TokenPair,
    ) -> Result<Statistics, StatisticsError> {
        let body = serde_json::json!({ "query": VIEWER_STATISTICS_QUERY });

        let permit = self.limiter.acquire().await;
        let sent = self
            .http
            .post(&self.config.graphql_endpoint)
            .bearer_auth(&credential.access_token)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                let _ = permit.release(None);
                return Err(err.into());
            }
        };
        if let Err(err) = permit.release(Some(response.headers())) {
            warn!(error = %err, "failed to update rate limit budget");
        }

        let bytes = response.bytes().await?;
        let parsed: GraphQlResponse = serde_json::from_slice(&bytes)?;
        if let Some(err) = classify_graphql_errors(&parsed.errors) {
            return Err(err);
        }

        let viewer = parsed
            .data
            .and_then(|data| data.viewer)
            .ok_or_else(|| StatisticsError::Upstream("response contained no viewer".into()))?;
        Ok(Statistics {
            display_name: viewer.name,
            anime_count: viewer.statistics.anime.count,
            manga_count: viewer.statistics.manga.count,
        })
    }
}
