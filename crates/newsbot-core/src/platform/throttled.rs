use std::{collections::BTreeSet, collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChannelId, GuildId, MessageRef, UserId},
    platform::{
        port::{ForumPort, GroupingPort, MemberDirectory, MessageSurface, Platform},
        types::{ForumThread, GroupHandle, GroupSpec, MentionPolicy, NewThread, ThreadEdit},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two platform API calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls touching the same channel or thread.
    pub per_channel_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_channel_min_interval: Duration::from_millis(1050),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return how long to wait before using it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Platform decorator that spaces out outbound calls.
///
/// Message and thread calls are spaced per channel as well as globally; group
/// and member calls only globally. The adapter still retries the odd 429.
pub struct ThrottledPlatform {
    inner: Arc<dyn Platform>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_channel: Mutex<HashMap<ChannelId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledPlatform {
    pub fn new(inner: Arc<dyn Platform>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_channel: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_channel(&self, channel_id: ChannelId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_channel.lock().await;
        map.entry(channel_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_channel_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_channel(&self, channel_id: ChannelId) {
        let global_wait = { self.global.lock().await.reserve() };
        let channel_wait = {
            let lim = self.limiter_for_channel(channel_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(channel_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl MemberDirectory for ThrottledPlatform {
    async fn member_ids(&self, guild_id: GuildId) -> Result<BTreeSet<UserId>> {
        self.throttle_global().await;
        self.inner.member_ids(guild_id).await
    }
}

#[async_trait]
impl GroupingPort for ThrottledPlatform {
    async fn can_manage_groups(&self, guild_id: GuildId) -> Result<bool> {
        self.throttle_global().await;
        self.inner.can_manage_groups(guild_id).await
    }

    async fn create_group(&self, guild_id: GuildId, spec: &GroupSpec) -> Result<GroupHandle> {
        self.throttle_global().await;
        self.inner.create_group(guild_id, spec).await
    }

    async fn assign(&self, group: &GroupHandle, user_id: UserId) -> Result<()> {
        self.throttle_global().await;
        self.inner.assign(group, user_id).await
    }

    async fn set_mentionable(&self, group: &GroupHandle, mentionable: bool) -> Result<()> {
        self.throttle_global().await;
        self.inner.set_mentionable(group, mentionable).await
    }

    async fn delete_group(&self, group: &GroupHandle) -> Result<()> {
        self.throttle_global().await;
        self.inner.delete_group(group).await
    }
}

#[async_trait]
impl MessageSurface for ThrottledPlatform {
    async fn send(
        &self,
        channel_id: ChannelId,
        content: &str,
        mentions: MentionPolicy,
    ) -> Result<MessageRef> {
        self.throttle_channel(channel_id).await;
        self.inner.send(channel_id, content, mentions).await
    }

    async fn edit(&self, msg: MessageRef, content: &str, mentions: MentionPolicy) -> Result<()> {
        self.throttle_channel(msg.channel_id).await;
        self.inner.edit(msg, content, mentions).await
    }
}

#[async_trait]
impl ForumPort for ThrottledPlatform {
    async fn active_threads(
        &self,
        guild_id: GuildId,
        forum_id: ChannelId,
    ) -> Result<Vec<ForumThread>> {
        self.throttle_global().await;
        self.inner.active_threads(guild_id, forum_id).await
    }

    async fn archived_threads(&self, forum_id: ChannelId, limit: usize) -> Result<Vec<ForumThread>> {
        self.throttle_global().await;
        self.inner.archived_threads(forum_id, limit).await
    }

    async fn create_thread(&self, forum_id: ChannelId, post: &NewThread) -> Result<ForumThread> {
        self.throttle_channel(forum_id).await;
        self.inner.create_thread(forum_id, post).await
    }

    async fn edit_thread(&self, thread_id: ChannelId, edit: &ThreadEdit) -> Result<()> {
        self.throttle_channel(thread_id).await;
        self.inner.edit_thread(thread_id, edit).await
    }
}
