//! Discord REST payloads and their mapping onto core types.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use newsbot_core::{
    domain::{ChannelId, GuildId, MessageId, RoleId, TagId, UserId},
    platform::types::{ForumThread, MentionPolicy},
};

/// Milliseconds between the Unix epoch and the first second of 2015.
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

pub(crate) const PERM_ADMINISTRATOR: u64 = 1 << 3;
pub(crate) const PERM_MANAGE_ROLES: u64 = 1 << 28;
pub(crate) const THREAD_FLAG_PINNED: u64 = 1 << 1;

#[derive(Debug, Deserialize)]
pub(crate) struct WireUser {
    pub id: UserId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMember {
    pub user: Option<WireUser>,
    #[serde(default)]
    pub roles: Vec<RoleId>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRole {
    pub id: RoleId,
    pub name: String,
    /// Permission bitset serialized as a decimal string.
    #[serde(default)]
    pub permissions: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireGuild {
    pub id: GuildId,
    pub owner_id: UserId,
    #[serde(default)]
    pub roles: Vec<WireRole>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireThreadMetadata {
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub locked: bool,
    pub archive_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireThread {
    pub id: ChannelId,
    pub parent_id: Option<ChannelId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub applied_tags: Vec<TagId>,
    #[serde(default)]
    pub flags: u64,
    pub thread_metadata: Option<WireThreadMetadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireThreadList {
    #[serde(default)]
    pub threads: Vec<WireThread>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRateLimit {
    pub retry_after: f64,
}

/// Creation time encoded in a snowflake.
pub(crate) fn snowflake_time(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22).saturating_add(DISCORD_EPOCH_MS);
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_default()
}

impl WireThread {
    pub(crate) fn archive_timestamp(&self) -> Option<&str> {
        self.thread_metadata
            .as_ref()
            .and_then(|m| m.archive_timestamp.as_deref())
    }

    pub(crate) fn into_thread(self) -> ForumThread {
        let meta = self.thread_metadata.unwrap_or_default();
        ForumThread {
            created_at: snowflake_time(self.id.0),
            id: self.id,
            parent_id: self.parent_id,
            name: self.name,
            applied_tags: self.applied_tags,
            archived: meta.archived,
            locked: meta.locked,
            pinned: self.flags & THREAD_FLAG_PINNED != 0,
        }
    }
}

/// `allowed_mentions` object for an outgoing message. Nothing pings unless
/// the policy names it.
pub(crate) fn allowed_mentions(policy: &MentionPolicy) -> Value {
    match policy {
        MentionPolicy::None => json!({ "parse": [] }),
        MentionPolicy::Users(users) => json!({ "parse": [], "users": users }),
        MentionPolicy::Group(role) => json!({ "parse": [], "roles": [role] }),
    }
}

fn parse_permissions(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

/// Whether `member` may create and assign roles in `guild`.
///
/// Owner wins outright; otherwise the member's role permissions (plus the
/// implicit @everyone role, whose id equals the guild id) are OR-ed together.
pub(crate) fn can_manage_roles(guild: &WireGuild, bot_id: UserId, member: &WireMember) -> bool {
    if guild.owner_id == bot_id {
        return true;
    }
    let everyone = RoleId(guild.id.0);
    let perms = guild
        .roles
        .iter()
        .filter(|r| r.id == everyone || member.roles.contains(&r.id))
        .fold(0u64, |acc, r| acc | parse_permissions(&r.permissions));
    perms & (PERM_ADMINISTRATOR | PERM_MANAGE_ROLES) != 0
}
