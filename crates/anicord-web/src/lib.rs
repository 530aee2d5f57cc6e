//! HTTP surface for the account linking handshake.
//!
//! `/verify` sends the user to Discord, `/discord` stashes the Discord session
//! under a linking token and forwards to AniList, `/anilist` completes the
//! link and runs a first sync.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anicord_adapters::{PlatformApi, PlatformError, StatisticsError, StatisticsSource};
use anicord_core::LinkedAccount;
use anicord_storage::{
    ExpiringStore, PendingLinkStore, StorageError, UserRepository, DEFAULT_PENDING_LINK_CAPACITY,
    DEFAULT_PENDING_LINK_TTL,
};
use anicord_sync::{RemovalReason, Services, SyncConfig, SyncEngine, SyncError, SyncOutcome};
use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "anicord-web";

/// Lifetime of the CSRF state handed to Discord in `/verify`.
const PLATFORM_STATE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing query parameter: {0}")]
    MissingParameter(&'static str),
    #[error("authorization denied: {0}")]
    Denied(String),
    #[error("invalid state")]
    InvalidState,
    #[error("invalid session")]
    InvalidSession,
    #[error("failed to exchange discord code: {0}")]
    PlatformExchange(#[source] PlatformError),
    #[error("failed to exchange anilist code: {0}")]
    StatisticsExchange(#[source] StatisticsError),
    #[error("failed to resolve discord user: {0}")]
    Identity(#[source] PlatformError),
    #[error("failed to save user: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to sync user: {0}")]
    Sync(#[from] SyncError),
    #[error("failed to sync user: account removed ({0:?})")]
    Removed(RemovalReason),
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        warn!(error = %self, "link handshake failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Three-hop OAuth flow that produces a `LinkedAccount`.
pub struct LinkHandshake {
    users: Arc<dyn UserRepository>,
    platform: Arc<dyn PlatformApi>,
    statistics: Arc<dyn StatisticsSource>,
    engine: Arc<SyncEngine>,
    pending: PendingLinkStore,
    states: ExpiringStore<()>,
}

impl LinkHandshake {
    pub fn new(
        users: Arc<dyn UserRepository>,
        platform: Arc<dyn PlatformApi>,
        statistics: Arc<dyn StatisticsSource>,
        engine: Arc<SyncEngine>,
    ) -> Self {
        Self {
            users,
            platform,
            statistics,
            engine,
            pending: PendingLinkStore::new(DEFAULT_PENDING_LINK_TTL, DEFAULT_PENDING_LINK_CAPACITY),
            states: ExpiringStore::new(PLATFORM_STATE_TTL, DEFAULT_PENDING_LINK_CAPACITY),
        }
    }

    pub fn from_services(services: &Services, config: &SyncConfig) -> Self {
        Self::new(
            services.users.clone(),
            services.platform.clone(),
            services.statistics.clone(),
            services.engine.clone(),
        )
        .with_pending_links(PendingLinkStore::new(
            config.pending_link_ttl(),
            config.sync.pending_link_capacity,
        ))
    }

    pub fn with_pending_links(mut self, pending: PendingLinkStore) -> Self {
        self.pending = pending;
        self
    }

    /// Issue a CSRF state and return the Discord consent URL.
    pub async fn initiate(&self) -> String {
        let state = self.states.insert_random(()).await;
        self.platform.authorization_url(&state)
    }

    /// Exchange the Discord code, park the session under a fresh linking
    /// token and return the AniList consent URL carrying that token.
    pub async fn platform_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<String, HandshakeError> {
        if self.states.take(state).await.is_none() {
            return Err(HandshakeError::InvalidState);
        }
        let session = self
            .platform
            .exchange_code(code)
            .await
            .map_err(HandshakeError::PlatformExchange)?;
        let link_token = self.pending.insert_random(session).await;
        Ok(self.statistics.authorization_url(&link_token))
    }

    /// Finish the link. The pending entry is only consumed once every
    /// fallible upstream step has succeeded; losing the race to a concurrent
    /// callback with the same token reads as an invalid session.
    pub async fn third_party_callback(
        &self,
        code: &str,
        link_token: &str,
    ) -> Result<LinkedAccount, HandshakeError> {
        let session = self
            .pending
            .peek(link_token)
            .await
            .ok_or(HandshakeError::InvalidSession)?;
        let anilist = self
            .statistics
            .exchange_code(code)
            .await
            .map_err(HandshakeError::StatisticsExchange)?;
        let user = self
            .platform
            .current_user(&session)
            .await
            .map_err(HandshakeError::Identity)?;

        let session = self
            .pending
            .take(link_token)
            .await
            .ok_or(HandshakeError::InvalidSession)?;
        let account = LinkedAccount::new(user.id, session, anilist);
        self.users.upsert(&account).await?;
        info!(discord_id = %account.discord_id, username = %user.username, "linked account");

        match self.engine.sync_one_user(&account).await? {
            SyncOutcome::Published => Ok(account),
            SyncOutcome::Removed(reason) => Err(HandshakeError::Removed(reason)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handshake: Arc<LinkHandshake>,
}

impl AppState {
    pub fn new(handshake: LinkHandshake) -> Self {
        Self {
            handshake: Arc::new(handshake),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

impl CallbackParams {
    fn require(self) -> Result<(String, String), HandshakeError> {
        if let Some(error) = self.error {
            return Err(HandshakeError::Denied(error));
        }
        let code = self.code.ok_or(HandshakeError::MissingParameter("code"))?;
        let state = self.state.ok_or(HandshakeError::MissingParameter("state"))?;
        Ok((code, state))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/verify", get(verify_handler))
        .route("/discord", get(discord_callback_handler))
        .route("/anilist", get(anilist_callback_handler))
        .with_state(state)
}

/// Serve the handshake routes until `shutdown` resolves.
pub async fn serve(
    listen_addr: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")?;
    Ok(())
}

async fn verify_handler(State(state): State<AppState>) -> Redirect {
    Redirect::temporary(&state.handshake.initiate().await)
}

async fn discord_callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, HandshakeError> {
    let (code, csrf) = params.require()?;
    let url = state.handshake.platform_callback(&code, &csrf).await?;
    Ok(Redirect::temporary(&url))
}

async fn anilist_callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<&'static str, HandshakeError> {
    let (code, link_token) = params.require()?;
    state
        .handshake
        .third_party_callback(&code, &link_token)
        .await?;
    Ok("success")
}
