use chrono::{DateTime, Utc};

use crate::domain::{ChannelId, GuildId, RoleId, TagId, UserId};

/// Which mentions in an outgoing message are allowed to ping.
///
/// Everything not listed is rendered but silent, so a message can quote
/// `<@&role>` text without notifying anyone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MentionPolicy {
    #[default]
    None,
    Users(Vec<UserId>),
    Group(RoleId),
}

/// Request for a temporary grouping object (platform role).
///
/// Groups are always created with an empty permission set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSpec {
    pub name: String,
    pub mentionable: bool,
}

/// A created grouping object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupHandle {
    pub guild_id: GuildId,
    pub role_id: RoleId,
    pub name: String,
}

impl GroupHandle {
    /// Mention markup for this group.
    pub fn mention(&self) -> String {
        format!("<@&{}>", self.role_id)
    }
}

/// A thread inside a forum channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForumThread {
    pub id: ChannelId,
    pub parent_id: Option<ChannelId>,
    pub name: String,
    pub applied_tags: Vec<TagId>,
    pub archived: bool,
    pub locked: bool,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
}

impl ForumThread {
    pub fn has_tag(&self, tag: TagId) -> bool {
        self.applied_tags.contains(&tag)
    }

    /// Jump link to the thread.
    pub fn url(&self, guild_id: GuildId) -> String {
        format!("https://discord.com/channels/{guild_id}/{}", self.id)
    }
}

/// A new forum post: thread title, starter message and tags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewThread {
    pub name: String,
    pub content: String,
    pub applied_tags: Vec<TagId>,
}

/// Partial thread update; `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadEdit {
    pub applied_tags: Option<Vec<TagId>>,
    pub archived: Option<bool>,
    pub locked: Option<bool>,
    pub pinned: Option<bool>,
}

impl ThreadEdit {
    /// Lock and archive.
    pub fn close() -> Self {
        Self {
            archived: Some(true),
            locked: Some(true),
            ..Default::default()
        }
    }
}
