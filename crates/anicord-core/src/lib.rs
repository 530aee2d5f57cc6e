//! Core domain model for Anicord: linked accounts, OAuth token pairs and
//! role-connection payloads shared by every other crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, Serializer};

pub const CRATE_NAME: &str = "anicord-core";

/// OAuth scopes requested from Discord during the linking handshake.
pub const PLATFORM_SCOPES: [&str; 2] = ["identify", "role_connections.write"];

pub const ANIME_COUNT_KEY: &str = "anime_count";
pub const MANGA_COUNT_KEY: &str = "manga_count";

/// Discord user snowflake. Stored as `BIGINT` in PostgreSQL, so conversions to
/// and from `i64` preserve the bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscordId(pub u64);

impl DiscordId {
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(raw: i64) -> Self {
        Self(raw as u64)
    }
}

impl fmt::Display for DiscordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DiscordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Access/refresh token pair with the access token's expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
}

impl TokenPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expiry,
        }
    }

    /// True when the access token is expired or expires within `skew` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expiry <= now + skew
    }
}

// Tokens never end up in logs.
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Anything that can authenticate against Discord on behalf of a user.
pub trait PlatformSession: Send + Sync {
    fn access_token(&self) -> &str;
    fn refresh_token(&self) -> &str;
    fn expiry(&self) -> DateTime<Utc>;

    fn scopes(&self) -> &[&'static str] {
        &PLATFORM_SCOPES
    }
}

impl PlatformSession for TokenPair {
    fn access_token(&self) -> &str {
        &self.access_token
    }

    fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }
}

/// Persistent link between a Discord account and an AniList account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub discord_id: DiscordId,
    pub discord: TokenPair,
    pub anilist: TokenPair,
}

impl LinkedAccount {
    pub fn new(discord_id: DiscordId, discord: TokenPair, anilist: TokenPair) -> Self {
        Self {
            discord_id,
            discord,
            anilist,
        }
    }
}

impl PlatformSession for LinkedAccount {
    fn access_token(&self) -> &str {
        &self.discord.access_token
    }

    fn refresh_token(&self) -> &str {
        &self.discord.refresh_token
    }

    fn expiry(&self) -> DateTime<Utc> {
        self.discord.expiry
    }
}

/// Discord identity resolved from a platform session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformUser {
    pub id: DiscordId,
    pub username: String,
}

/// Viewer statistics pulled from AniList.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub display_name: String,
    pub anime_count: u32,
    pub manga_count: u32,
}

/// Body of Discord's "update application role connection" call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleConnectionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_username: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl RoleConnectionUpdate {
    /// Counts are sent as decimal strings, which is what Discord expects for
    /// integer metadata values.
    pub fn from_statistics(platform_name: &str, stats: &Statistics) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(ANIME_COUNT_KEY.to_string(), stats.anime_count.to_string());
        metadata.insert(MANGA_COUNT_KEY.to_string(), stats.manga_count.to_string());
        Self {
            platform_name: Some(platform_name.to_string()),
            platform_username: Some(stats.display_name.clone()),
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoleConnectionMetadataType {
    IntegerLessThanOrEqual = 1,
    IntegerGreaterThanOrEqual = 2,
    IntegerEqual = 3,
    IntegerNotEqual = 4,
    DatetimeLessThanOrEqual = 5,
    DatetimeGreaterThanOrEqual = 6,
    BooleanEqual = 7,
    BooleanNotEqual = 8,
}

impl Serialize for RoleConnectionMetadataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// One application-level role-connection metadata declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleConnectionMetadata {
    #[serde(rename = "type")]
    pub kind: RoleConnectionMetadataType,
    pub key: String,
    pub name: String,
    pub description: String,
}

/// The metadata fields Anicord declares for its application.
pub fn statistics_metadata() -> Vec<RoleConnectionMetadata> {
    vec![
        RoleConnectionMetadata {
            kind: RoleConnectionMetadataType::IntegerGreaterThanOrEqual,
            key: ANIME_COUNT_KEY.to_string(),
            name: "Anime Watched".to_string(),
            description: "How many anime you have watched".to_string(),
        },
        RoleConnectionMetadata {
            kind: RoleConnectionMetadataType::IntegerGreaterThanOrEqual,
            key: MANGA_COUNT_KEY.to_string(),
            name: "Manga Read".to_string(),
            description: "How many manga you have read".to_string(),
        },
    ]
}
