//! Persistence, shared rate limiting and HTTP client utilities for Anicord.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anicord_core::{DiscordId, LinkedAccount, TokenPair};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use reqwest::header::HeaderMap;
use sqlx::{PgPool, SqlitePool};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "anicord-storage";

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

pub const LINK_TOKEN_LEN: usize = 32;
pub const DEFAULT_PENDING_LINK_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_PENDING_LINK_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("anicord/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Build the shared outbound client. The timeout bounds every request, so a
/// hung upstream surfaces as a transport error instead of a stalled sync.
pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// Process-wide permit budget for the statistics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Instant,
}

impl RateBudget {
    fn roll_over(&mut self, now: Instant) {
        self.reset_at = now;
        self.remaining = self.limit;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitHeaderError {
    #[error("malformed {header} header value {value:?}")]
    Malformed { header: &'static str, value: String },
}

/// Single admission gate for the statistics API.
///
/// Holding a [`RatePermit`] means holding the budget exclusively, so at most
/// one gated call is in flight across the process. The budget starts at one
/// permit and is replaced by whatever the upstream reports after each call.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    budget: Arc<Mutex<RateBudget>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            budget: Arc::new(Mutex::new(RateBudget {
                limit: 1,
                remaining: 1,
                reset_at: Instant::now(),
            })),
        }
    }

    /// Wait for a permit and consume it. If the window is exhausted the caller
    /// sleeps until the reset instant while still holding the budget.
    pub async fn acquire(&self) -> RatePermit {
        let mut budget = self.budget.clone().lock_owned().await;
        let now = Instant::now();
        if now > budget.reset_at {
            budget.roll_over(now);
        }

        if budget.remaining == 0 {
            let wait = budget.reset_at.saturating_duration_since(now);
            debug!(wait_ms = wait.as_millis() as u64, "rate limit exhausted; waiting for reset");
            tokio::time::sleep_until(budget.reset_at).await;
            budget.roll_over(Instant::now());
        }

        budget.remaining -= 1;
        RatePermit { budget }
    }

    pub async fn snapshot(&self) -> RateBudget {
        *self.budget.lock().await
    }
}

/// Exclusive hold on the rate budget for one outbound call. Dropping the
/// permit releases it without touching the budget.
#[derive(Debug)]
pub struct RatePermit {
    budget: OwnedMutexGuard<RateBudget>,
}

impl RatePermit {
    /// Update the budget from the completed call's response headers and give
    /// up exclusive access. `None` means the call never produced a response.
    ///
    /// Headers are parsed before anything is applied, so a malformed value
    /// leaves the budget untouched. The permit is released either way.
    pub fn release(mut self, headers: Option<&HeaderMap>) -> Result<(), RateLimitHeaderError> {
        let Some(headers) = headers else {
            return Ok(());
        };

        let limit = header_value::<u32>(headers, RATE_LIMIT_LIMIT_HEADER)?;
        let remaining = header_value::<u32>(headers, RATE_LIMIT_REMAINING_HEADER)?;
        let retry_after = header_value::<u64>(headers, RETRY_AFTER_HEADER)?;
        let reset_at = match retry_after {
            Some(seconds) => Some(
                Instant::now()
                    .checked_add(Duration::from_secs(seconds))
                    .ok_or_else(|| RateLimitHeaderError::Malformed {
                        header: RETRY_AFTER_HEADER,
                        value: seconds.to_string(),
                    })?,
            ),
            None => None,
        };

        let budget = &mut *self.budget;
        if let Some(limit) = limit {
            budget.limit = limit.max(1);
        }
        if let Some(remaining) = remaining {
            budget.remaining = remaining;
        }
        if let Some(reset_at) = reset_at {
            budget.reset_at = reset_at;
            budget.remaining = 0;
        }
        budget.remaining = budget.remaining.min(budget.limit);
        Ok(())
    }
}

fn header_value<T: FromStr>(
    headers: &HeaderMap,
    name: &'static str,
) -> Result<Option<T>, RateLimitHeaderError> {
    let Some(raw) = headers.get(name) else {
        return Ok(None);
    };
    let malformed = || RateLimitHeaderError::Malformed {
        header: name,
        value: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
    };
    let text = raw.to_str().map_err(|_| malformed())?.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some).map_err(|_| malformed())
}

/// Random alphanumeric token used for OAuth `state` values.
pub fn random_token(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

#[derive(Debug)]
struct ExpiringEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Concurrency-safe map of single-use values keyed by random tokens.
///
/// Expired entries are swept on every access. When full, the oldest entry is
/// evicted to make room.
#[derive(Debug)]
pub struct ExpiringStore<V> {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, ExpiringEntry<V>>>,
}

/// Pending links map a linking token to the Discord session from the first
/// handshake hop.
pub type PendingLinkStore = ExpiringStore<TokenPair>;

impl<V: Clone + Send> ExpiringStore<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);

        if entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                warn!(capacity = self.capacity, "expiring store full; evicting oldest entry");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.into(),
            ExpiringEntry {
                value,
                inserted_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Store `value` under a fresh random token and return the token.
    pub async fn insert_random(&self, value: V) -> String {
        let token = random_token(LINK_TOKEN_LEN);
        self.insert(token.clone(), value).await;
        token
    }

    /// Look up a live entry without consuming it.
    pub async fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Remove and return a live entry. Only one caller can win a given key.
    pub async fn take(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.remove(key).map(|entry| entry.value)
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no linked account for discord user {0}")]
    NotFound(DiscordId),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Persistence for linked accounts, unique on the Discord user id.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, discord_id: DiscordId) -> Result<Option<LinkedAccount>, StorageError>;

    async fn list(&self) -> Result<Vec<LinkedAccount>, StorageError>;

    /// Insert or overwrite every token field of the account.
    async fn upsert(&self, account: &LinkedAccount) -> Result<(), StorageError>;

    async fn update_discord_tokens(
        &self,
        discord_id: DiscordId,
        tokens: &TokenPair,
    ) -> Result<(), StorageError>;

    /// Returns whether a record was removed.
    async fn delete(&self, discord_id: DiscordId) -> Result<bool, StorageError>;
}

#[derive(Debug, Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    discord_id: i64,
    discord_access_token: String,
    discord_refresh_token: String,
    discord_expiry: DateTime<Utc>,
    anilist_access_token: String,
    anilist_refresh_token: String,
    anilist_expiry: DateTime<Utc>,
}

impl From<UserRow> for LinkedAccount {
    fn from(row: UserRow) -> Self {
        LinkedAccount {
            discord_id: DiscordId::from_i64(row.discord_id),
            discord: TokenPair::new(
                row.discord_access_token,
                row.discord_refresh_token,
                row.discord_expiry,
            ),
            anilist: TokenPair::new(
                row.anilist_access_token,
                row.anilist_refresh_token,
                row.anilist_expiry,
            ),
        }
    }
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[tracing::instrument(name = "db.migrate", skip_all, err)]
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations/postgres")
            .run(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    #[tracing::instrument(name = "db.users.get", skip_all, fields(%discord_id), err)]
    async fn get(&self, discord_id: DiscordId) -> Result<Option<LinkedAccount>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT discord_id, discord_access_token, discord_refresh_token, discord_expiry,
                   anilist_access_token, anilist_refresh_token, anilist_expiry
              FROM users
             WHERE discord_id = $1
            "#,
        )
        .bind(discord_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[tracing::instrument(name = "db.users.list", skip_all, err)]
    async fn list(&self) -> Result<Vec<LinkedAccount>, StorageError> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT discord_id, discord_access_token, discord_refresh_token, discord_expiry,
                   anilist_access_token, anilist_refresh_token, anilist_expiry
              FROM users
             ORDER BY discord_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[tracing::instrument(
        name = "db.users.upsert",
        skip_all,
        fields(discord_id = %account.discord_id),
        err,
    )]
    async fn upsert(&self, account: &LinkedAccount) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO users (
                discord_id,
                discord_access_token,
                discord_refresh_token,
                discord_expiry,
                anilist_access_token,
                anilist_refresh_token,
                anilist_expiry
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (discord_id) DO UPDATE SET
                discord_access_token = EXCLUDED.discord_access_token,
                discord_refresh_token = EXCLUDED.discord_refresh_token,
                discord_expiry = EXCLUDED.discord_expiry,
                anilist_access_token = EXCLUDED.anilist_access_token,
                anilist_refresh_token = EXCLUDED.anilist_refresh_token,
                anilist_expiry = EXCLUDED.anilist_expiry
            "#,
        )
        .bind(account.discord_id.as_i64())
        .bind(&account.discord.access_token)
        .bind(&account.discord.refresh_token)
        .bind(account.discord.expiry)
        .bind(&account.anilist.access_token)
        .bind(&account.anilist.refresh_token)
        .bind(account.anilist.expiry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(
        name = "db.users.update_discord_tokens",
        skip_all,
        fields(%discord_id),
        err,
    )]
    async fn update_discord_tokens(
        &self,
        discord_id: DiscordId,
        tokens: &TokenPair,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET discord_access_token = $2,
                   discord_refresh_token = $3,
                   discord_expiry = $4
             WHERE discord_id = $1
            "#,
        )
        .bind(discord_id.as_i64())
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expiry)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(discord_id));
        }
        Ok(())
    }

    #[tracing::instrument(name = "db.users.delete", skip_all, fields(%discord_id), err)]
    async fn delete(&self, discord_id: DiscordId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM users WHERE discord_id = $1")
            .bind(discord_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// SQLite-backed repository for single-node deployments.
#[derive(Debug, Clone)]
pub struct SqliteUserRepository {
    pool: SqlitePool,
}

impl SqliteUserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[tracing::instrument(name = "db.migrate", skip_all, err)]
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations/sqlite")
            .run(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserRepository for SqliteUserRepository {
    #[tracing::instrument(name = "db.users.get", skip_all, fields(%discord_id), err)]
    async fn get(&self, discord_id: DiscordId) -> Result<Option<LinkedAccount>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT discord_id, discord_access_token, discord_refresh_token, discord_expiry,
                   anilist_access_token, anilist_refresh_token, anilist_expiry
              FROM users
             WHERE discord_id = ?1
            "#,
        )
        .bind(discord_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[tracing::instrument(name = "db.users.list", skip_all, err)]
    async fn list(&self) -> Result<Vec<LinkedAccount>, StorageError> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT discord_id, discord_access_token, discord_refresh_token, discord_expiry,
                   anilist_access_token, anilist_refresh_token, anilist_expiry
              FROM users
             ORDER BY discord_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[tracing::instrument(
        name = "db.users.upsert",
        skip_all,
        fields(discord_id = %account.discord_id),
        err,
    )]
    async fn upsert(&self, account: &LinkedAccount) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO users (
                discord_id,
                discord_access_token,
                discord_refresh_token,
                discord_expiry,
                anilist_access_token,
                anilist_refresh_token,
                anilist_expiry
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(discord_id) DO UPDATE SET
                discord_access_token = excluded.discord_access_token,
                discord_refresh_token = excluded.discord_refresh_token,
                discord_expiry = excluded.discord_expiry,
                anilist_access_token = excluded.anilist_access_token,
                anilist_refresh_token = excluded.anilist_refresh_token,
                anilist_expiry = excluded.anilist_expiry
            "#,
        )
        .bind(account.discord_id.as_i64())
        .bind(&account.discord.access_token)
        .bind(&account.discord.refresh_token)
        .bind(account.discord.expiry)
        .bind(&account.anilist.access_token)
        .bind(&account.anilist.refresh_token)
        .bind(account.anilist.expiry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(
        name = "db.users.update_discord_tokens",
        skip_all,
        fields(%discord_id),
        err,
    )]
    async fn update_discord_tokens(
        &self,
        discord_id: DiscordId,
        tokens: &TokenPair,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET discord_access_token = ?2,
                   discord_refresh_token = ?3,
                   discord_expiry = ?4
             WHERE discord_id = ?1
            "#,
        )
        .bind(discord_id.as_i64())
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expiry)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(discord_id));
        }
        Ok(())
    }

    #[tracing::instrument(name = "db.users.delete", skip_all, fields(%discord_id), err)]
    async fn delete(&self, discord_id: DiscordId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM users WHERE discord_id = ?1")
            .bind(discord_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Map-backed repository with the same upsert semantics as the PostgreSQL
/// one. Used by tests and local dry runs.
#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    users: Mutex<BTreeMap<DiscordId, LinkedAccount>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = LinkedAccount>) -> Self {
        Self {
            users: Mutex::new(
                accounts
                    .into_iter()
                    .map(|account| (account.discord_id, account))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn get(&self, discord_id: DiscordId) -> Result<Option<LinkedAccount>, StorageError> {
        Ok(self.users.lock().await.get(&discord_id).cloned())
    }

    async fn list(&self) -> Result<Vec<LinkedAccount>, StorageError> {
        Ok(self.users.lock().await.values().cloned().collect())
    }

    async fn upsert(&self, account: &LinkedAccount) -> Result<(), StorageError> {
        self.users
            .lock()
            .await
            .insert(account.discord_id, account.clone());
        Ok(())
    }

    async fn update_discord_tokens(
        &self,
        discord_id: DiscordId,
        tokens: &TokenPair,
    ) -> Result<(), StorageError> {
        let mut users = self.users.lock().await;
        let account = users
            .get_mut(&discord_id)
            .ok_or(StorageError::NotFound(discord_id))?;
        account.discord = tokens.clone();
        Ok(())
    }

    async fn delete(&self, discord_id: DiscordId) -> Result<bool, StorageError> {
        Ok(self.users.lock().await.remove(&discord_id).is_some())
    }
}
