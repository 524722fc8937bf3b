//! Mass mention through a temporary platform role.
//!
//! `CREATE_GROUP -> ASSIGN_MEMBERS -> ENABLE_MENTION -> SEND -> [GHOST_STRIP] -> CLEANUP`.
//! Once the group exists, cleanup runs whatever happened in between; only a
//! failed delete can leak it, and that is reported separately.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use tokio::time::{sleep, Instant};

use crate::{
    chunker::{split_message, DEFAULT_LIMIT},
    domain::{ChannelId, GuildId, MessageRef, UserId},
    platform::{
        port::{Platform, StatusSurface},
        types::{GroupHandle, GroupSpec, MentionPolicy},
    },
};

/// Longest group name the platform accepts.
const MAX_GROUP_NAME: usize = 100;

#[derive(Clone, Copy, Debug)]
pub struct BroadcastSettings {
    /// Pause between sending and stripping a ghost mention.
    pub ghost_delay: Duration,
    /// Minimum spacing between progress updates.
    pub progress_interval: Duration,
    pub message_limit: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            ghost_delay: Duration::from_millis(2000),
            progress_interval: Duration::from_millis(1500),
            message_limit: DEFAULT_LIMIT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BroadcastRequest {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub targets: BTreeSet<UserId>,
    /// Shown as the group name and kept in the message after a ghost strip.
    pub display_name: String,
    pub message: Option<String>,
    pub ghost: bool,
}

/// Failures that stop a broadcast before anything was created.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("I need the Manage Roles permission to notify a virtual role")]
    MissingPrivilege,

    #[error("could not check my permissions: {0}")]
    PrivilegeCheck(#[source] crate::Error),

    #[error("could not list server members: {0}")]
    MemberLookup(#[source] crate::Error),

    #[error("could not create the temporary role: {0}")]
    CreateGroup(#[source] crate::Error),
}

/// Where a broadcast stopped after the temporary group was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastStage {
    Assign,
    EnableMention,
    Send,
    GhostStrip,
}

impl fmt::Display for BroadcastStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BroadcastStage::Assign => "adding members",
            BroadcastStage::EnableMention => "making the role mentionable",
            BroadcastStage::Send => "sending the message",
            BroadcastStage::GhostStrip => "removing the mention",
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub total: usize,
    pub added: usize,
    pub skipped: usize,
    /// First message sent (the one carrying the mention).
    pub message: Option<MessageRef>,
    pub failure: Option<(BroadcastStage, String)>,
    /// Set when the temporary group could not be deleted and needs manual cleanup.
    pub cleanup_error: Option<String>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> bool {
        self.message.is_some()
            && !matches!(
                self.failure,
                Some((BroadcastStage::Send | BroadcastStage::EnableMention, _))
            )
    }
}

struct StageFailure(BroadcastStage, String);

/// Rate-limits status updates to one per interval, plus the final one.
struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn should_emit(&mut self, last_item: bool) -> bool {
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some(prev) => now.duration_since(prev) >= self.interval,
        };
        if due || last_item {
            self.last = Some(now);
            return true;
        }
        false
    }
}

pub struct Broadcaster {
    platform: Arc<dyn Platform>,
    settings: BroadcastSettings,
}

impl Broadcaster {
    pub fn new(platform: Arc<dyn Platform>, settings: BroadcastSettings) -> Self {
        Self { platform, settings }
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.settings
    }

    pub async fn broadcast(
        &self,
        req: &BroadcastRequest,
        status: &dyn StatusSurface,
    ) -> std::result::Result<BroadcastReport, BroadcastError> {
        match self.platform.can_manage_groups(req.guild_id).await {
            Ok(true) => {}
            Ok(false) => return Err(BroadcastError::MissingPrivilege),
            Err(e) => return Err(BroadcastError::PrivilegeCheck(e)),
        }

        let members = self
            .platform
            .member_ids(req.guild_id)
            .await
            .map_err(BroadcastError::MemberLookup)?;
        let reachable: Vec<UserId> = req
            .targets
            .iter()
            .copied()
            .filter(|u| members.contains(u))
            .collect();

        let mut report = BroadcastReport {
            total: req.targets.len(),
            skipped: req.targets.len() - reachable.len(),
            ..Default::default()
        };
        if reachable.is_empty() {
            report.failure = Some((
                BroadcastStage::Assign,
                "none of the subscribers is still a member of this server".to_string(),
            ));
            return Ok(report);
        }

        let spec = GroupSpec {
            name: truncate_chars(&req.display_name, MAX_GROUP_NAME),
            mentionable: false,
        };
        let group = self
            .platform
            .create_group(req.guild_id, &spec)
            .await
            .map_err(BroadcastError::CreateGroup)?;
        tracing::info!(
            "[broadcast] guild {}: temporary role {} for `{}` ({} reachable of {})",
            req.guild_id,
            group.role_id,
            req.display_name,
            reachable.len(),
            report.total
        );

        if let Err(StageFailure(stage, msg)) =
            self.deliver(&group, &reachable, req, status, &mut report).await
        {
            tracing::warn!("[broadcast] `{}` stopped while {stage}: {msg}", req.display_name);
            report.failure = Some((stage, msg));
        }

        if let Err(e) = self.platform.delete_group(&group).await {
            tracing::error!(
                "[broadcast] failed to delete temporary role {} in guild {}: {e}",
                group.role_id,
                req.guild_id
            );
            report.cleanup_error = Some(format!(
                "the temporary role `{}` (id {}) could not be deleted ({e}); please delete it manually",
                group.name, group.role_id
            ));
        }

        tracing::info!(
            "[broadcast] `{}` done: added={} skipped={} total={}",
            req.display_name,
            report.added,
            report.skipped,
            report.total
        );
        Ok(report)
    }

    async fn deliver(
        &self,
        group: &GroupHandle,
        reachable: &[UserId],
        req: &BroadcastRequest,
        status: &dyn StatusSurface,
        report: &mut BroadcastReport,
    ) -> std::result::Result<(), StageFailure> {
        let mut progress = ProgressThrottle::new(self.settings.progress_interval);
        for (i, user_id) in reachable.iter().enumerate() {
            match self.platform.assign(group, *user_id).await {
                Ok(()) => report.added += 1,
                Err(e) => {
                    tracing::debug!("[broadcast] could not add {user_id} to {}: {e}", group.role_id);
                    report.skipped += 1;
                }
            }

            let processed = i + 1;
            if progress.should_emit(processed == reachable.len()) {
                let text = format!(
                    "⏳ Preparing `{}`: {processed}/{} processed, {} added, {} skipped",
                    req.display_name,
                    reachable.len(),
                    report.added,
                    report.skipped
                );
                if let Err(e) = status.update(&text).await {
                    tracing::debug!("[broadcast] progress update failed: {e}");
                }
            }
        }

        if report.added == 0 {
            return Err(StageFailure(
                BroadcastStage::Assign,
                "no subscriber could be added to the temporary role".to_string(),
            ));
        }

        self.platform
            .set_mentionable(group, true)
            .await
            .map_err(|e| StageFailure(BroadcastStage::EnableMention, e.to_string()))?;

        let mention = group.mention();
        let plain = format!("@{}", req.display_name);
        let prefix_len = mention.chars().count().max(plain.chars().count()) + 1;
        let chunks = match req.message.as_deref().filter(|m| !m.trim().is_empty()) {
            Some(body) => split_message(
                body,
                self.settings.message_limit.saturating_sub(prefix_len).max(1),
            ),
            None => Vec::new(),
        };
        let first_body = chunks.first().cloned();
        let with_prefix = |prefix: &str| match &first_body {
            Some(body) => format!("{prefix} {body}"),
            None => prefix.to_string(),
        };

        let first = self
            .platform
            .send(
                req.channel_id,
                &with_prefix(&mention),
                MentionPolicy::Group(group.role_id),
            )
            .await
            .map_err(|e| StageFailure(BroadcastStage::Send, e.to_string()))?;
        report.message = Some(first);

        for chunk in chunks.iter().skip(1) {
            self.platform
                .send(req.channel_id, chunk, MentionPolicy::None)
                .await
                .map_err(|e| StageFailure(BroadcastStage::Send, e.to_string()))?;
        }

        if req.ghost {
            sleep(self.settings.ghost_delay).await;
            self.platform
                .edit(first, &with_prefix(&plain), MentionPolicy::None)
                .await
                .map_err(|e| StageFailure(BroadcastStage::GhostStrip, e.to_string()))?;
        }
        Ok(())
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}
