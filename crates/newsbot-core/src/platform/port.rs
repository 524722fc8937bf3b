use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;

use crate::{
    domain::{ChannelId, GuildId, MessageRef, UserId},
    platform::types::{ForumThread, GroupHandle, GroupSpec, MentionPolicy, NewThread, ThreadEdit},
    Result,
};

/// Enumerates the members currently reachable in a guild.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn member_ids(&self, guild_id: GuildId) -> Result<BTreeSet<UserId>>;
}

/// Temporary grouping objects used to batch-mention many users at once.
#[async_trait]
pub trait GroupingPort: Send + Sync {
    /// Whether the bot holds the privilege needed to create and assign groups.
    async fn can_manage_groups(&self, guild_id: GuildId) -> Result<bool>;

    async fn create_group(&self, guild_id: GuildId, spec: &GroupSpec) -> Result<GroupHandle>;
    async fn assign(&self, group: &GroupHandle, user_id: UserId) -> Result<()>;
    async fn set_mentionable(&self, group: &GroupHandle, mentionable: bool) -> Result<()>;
    async fn delete_group(&self, group: &GroupHandle) -> Result<()>;
}

#[async_trait]
pub trait MessageSurface: Send + Sync {
    async fn send(
        &self,
        channel_id: ChannelId,
        content: &str,
        mentions: MentionPolicy,
    ) -> Result<MessageRef>;

    async fn edit(&self, msg: MessageRef, content: &str, mentions: MentionPolicy) -> Result<()>;
}

/// Forum threads (posts) of a forum channel.
#[async_trait]
pub trait ForumPort: Send + Sync {
    async fn active_threads(&self, guild_id: GuildId, forum_id: ChannelId)
        -> Result<Vec<ForumThread>>;

    /// Most recently archived public threads, newest first.
    async fn archived_threads(&self, forum_id: ChannelId, limit: usize)
        -> Result<Vec<ForumThread>>;

    async fn create_thread(&self, forum_id: ChannelId, post: &NewThread) -> Result<ForumThread>;
    async fn edit_thread(&self, thread_id: ChannelId, edit: &ThreadEdit) -> Result<()>;
}

/// Everything the bot needs from the chat platform.
pub trait Platform: MemberDirectory + GroupingPort + MessageSurface + ForumPort {}

impl<T> Platform for T where T: MemberDirectory + GroupingPort + MessageSurface + ForumPort + ?Sized {}

/// Where a long-running operation reports progress.
#[async_trait]
pub trait StatusSurface: Send + Sync {
    async fn update(&self, content: &str) -> Result<()>;
}

/// A status surface backed by one editable message.
pub struct MessageStatus<S: MessageSurface + ?Sized> {
    surface: Arc<S>,
    msg: MessageRef,
}

impl<S: MessageSurface + ?Sized> MessageStatus<S> {
    pub fn new(surface: Arc<S>, msg: MessageRef) -> Self {
        Self { surface, msg }
    }

    /// Post `initial` to `channel_id` and track that message.
    pub async fn post(surface: Arc<S>, channel_id: ChannelId, initial: &str) -> Result<Self> {
        let msg = surface.send(channel_id, initial, MentionPolicy::None).await?;
        Ok(Self { surface, msg })
    }

    pub fn message(&self) -> MessageRef {
        self.msg
    }
}

#[async_trait]
impl<S: MessageSurface + ?Sized> StatusSurface for MessageStatus<S> {
    async fn update(&self, content: &str) -> Result<()> {
        self.surface.edit(self.msg, content, MentionPolicy::None).await
    }
}

/// Status surface that only logs; used by unattended runs.
pub struct LogStatus;

#[async_trait]
impl StatusSurface for LogStatus {
    async fn update(&self, content: &str) -> Result<()> {
        tracing::debug!("[status] {content}");
        Ok(())
    }
}
