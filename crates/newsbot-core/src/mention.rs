//! Entry points used by the command layer to mention virtual roles (or
//! operator-declared platform roles) and to manage their configuration.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    broadcast::{BroadcastError, BroadcastReport, BroadcastRequest, Broadcaster},
    chunker::split_message,
    domain::{ChannelId, GuildId, MessageRef, RoleId, TagId, UserId},
    platform::{
        port::{Platform, StatusSurface},
        types::MentionPolicy,
    },
    role_config::{RoleConfig, RoleConfigRejection, RoleConfigStore},
    subscriptions::SubscriptionStore,
};

/// Most choices an autocomplete response may carry.
pub const MAX_AUTOCOMPLETE_CHOICES: usize = 25;
/// Longest autocomplete label.
pub const MAX_CHOICE_LABEL: usize = 100;

/// The member running a command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Invoker {
    pub user_id: UserId,
    pub role_ids: BTreeSet<RoleId>,
    pub is_owner: bool,
    /// Holds an administrator-equivalent permission.
    pub is_admin: bool,
}

impl Invoker {
    pub fn is_privileged(&self) -> bool {
        self.is_owner || self.is_admin
    }
}

/// A real platform role that publishers may mention directly, declared per
/// guild in the mention targets file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub role_id: RoleId,
    pub name: String,
    #[serde(default, alias = "allowed_by_roles")]
    pub allowed_publishers: BTreeSet<RoleId>,
}

/// What a mention key resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MentionTarget {
    PlatformRole(PlatformTarget),
    Virtual(RoleConfig),
}

impl MentionTarget {
    pub fn name(&self) -> &str {
        match self {
            MentionTarget::PlatformRole(t) => &t.name,
            MentionTarget::Virtual(cfg) => &cfg.name,
        }
    }

    pub fn allowed_publishers(&self) -> &BTreeSet<RoleId> {
        match self {
            MentionTarget::PlatformRole(t) => &t.allowed_publishers,
            MentionTarget::Virtual(cfg) => &cfg.allowed_publishers,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NotifyRequest {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub role_key: String,
    pub message: Option<String>,
    pub ghost: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    NotFound,
    Unauthorized,
    /// Nobody subscribed; `posted` tells whether the attached message was sent anyway.
    NoSubscribers { posted: bool },
    Delivered(BroadcastReport),
    /// A platform role was mentioned directly; no temporary role was involved.
    RoleMentioned(MessageRef),
    Failed(String),
}

/// Result of a notify command plus the text to show the invoker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyReply {
    pub outcome: NotifyOutcome,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutocompleteChoice {
    pub label: String,
    pub value: String,
}

/// Role fields as entered by an editor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleDraft {
    pub key: String,
    pub name: String,
    pub description: String,
    pub allowed_publishers: BTreeSet<RoleId>,
    pub external_tag_id: Option<TagId>,
}

pub struct MentionService {
    subscriptions: SubscriptionStore,
    roles: RoleConfigStore,
    platform: Arc<dyn Platform>,
    broadcaster: Broadcaster,
    /// Publishers applied when a non-privileged editor names none.
    default_publishers: BTreeSet<RoleId>,
    platform_targets: BTreeMap<GuildId, BTreeMap<String, PlatformTarget>>,
}

impl MentionService {
    pub fn new(
        subscriptions: SubscriptionStore,
        roles: RoleConfigStore,
        platform: Arc<dyn Platform>,
        broadcaster: Broadcaster,
        default_publishers: BTreeSet<RoleId>,
    ) -> Self {
        Self {
            subscriptions,
            roles,
            platform,
            broadcaster,
            default_publishers,
            platform_targets: BTreeMap::new(),
        }
    }

    pub fn with_platform_targets(
        mut self,
        targets: BTreeMap<GuildId, BTreeMap<String, PlatformTarget>>,
    ) -> Self {
        self.platform_targets = targets;
        self
    }

    pub async fn resolve(&self, role_key: &str, guild_id: GuildId) -> Option<RoleConfig> {
        self.roles.get_role_config(guild_id, role_key).await
    }

    /// Resolve a mention key. Platform targets win over a virtual role with
    /// the same key.
    pub async fn resolve_target(&self, key: &str, guild_id: GuildId) -> Option<MentionTarget> {
        if let Some(t) = self.platform_targets.get(&guild_id).and_then(|m| m.get(key)) {
            return Some(MentionTarget::PlatformRole(t.clone()));
        }
        self.resolve(key, guild_id).await.map(MentionTarget::Virtual)
    }

    pub async fn is_authorized(&self, invoker: &Invoker, role_key: &str, guild_id: GuildId) -> bool {
        match self.resolve_target(role_key, guild_id).await {
            Some(target) => can_publish(invoker, target.allowed_publishers()),
            None => false,
        }
    }

    pub async fn subscribers(&self, role_key: &str, guild_id: GuildId) -> BTreeSet<UserId> {
        self.subscriptions.get_users_in_role(role_key, guild_id).await
    }

    /// Role keys the invoker may notify whose key or name contains `query`
    /// (case-insensitive), in configured order.
    pub async fn autocomplete(
        &self,
        invoker: &Invoker,
        guild_id: GuildId,
        query: &str,
    ) -> Vec<AutocompleteChoice> {
        let needle = query.trim().to_lowercase();
        let platform = self.platform_targets.get(&guild_id);
        let virtual_roles = self.roles.get_guild_roles_ordered(guild_id).await;

        let declared = platform
            .into_iter()
            .flatten()
            .map(|(key, t)| (key.as_str(), t.name.as_str(), &t.allowed_publishers));
        let configured = virtual_roles
            .iter()
            .filter(|(key, _)| !platform.is_some_and(|p| p.contains_key(key)))
            .map(|(key, cfg)| (key.as_str(), cfg.name.as_str(), &cfg.allowed_publishers));

        declared
            .chain(configured)
            .filter(|(_, _, allowed)| can_publish(invoker, allowed))
            .filter(|(key, name, _)| {
                needle.is_empty()
                    || key.to_lowercase().contains(&needle)
                    || name.to_lowercase().contains(&needle)
            })
            .take(MAX_AUTOCOMPLETE_CHOICES)
            .map(|(key, name, _)| AutocompleteChoice {
                label: choice_label(name, key),
                value: key.to_string(),
            })
            .collect()
    }

    /// Mention a virtual role, optionally with an attached message.
    pub async fn notify(
        &self,
        invoker: &Invoker,
        req: NotifyRequest,
        status: &dyn StatusSurface,
    ) -> NotifyReply {
        let key = req.role_key.as_str();
        let cfg = match self.resolve_target(key, req.guild_id).await {
            None => {
                return reply(
                    NotifyOutcome::NotFound,
                    format!("❌ No virtual role named `{key}` exists."),
                )
            }
            Some(target) if !can_publish(invoker, target.allowed_publishers()) => {
                return reply(
                    NotifyOutcome::Unauthorized,
                    format!("🚫 You are not allowed to notify `{key}`."),
                )
            }
            Some(MentionTarget::PlatformRole(target)) => {
                return self
                    .mention_platform_role(invoker, req.channel_id, &target, req.message)
                    .await
            }
            Some(MentionTarget::Virtual(cfg)) => cfg,
        };

        let targets = self.subscribers(key, req.guild_id).await;
        let message = req.message.filter(|m| !m.trim().is_empty());
        if targets.is_empty() {
            return self.post_unsubscribed(req.channel_id, &cfg, key, message).await;
        }

        let breq = BroadcastRequest {
            guild_id: req.guild_id,
            channel_id: req.channel_id,
            targets,
            display_name: cfg.name.clone(),
            message,
            ghost: req.ghost,
        };
        match self.broadcaster.broadcast(&breq, status).await {
            Ok(report) => {
                tracing::info!(
                    "[notify] {} notified `{key}` in guild {}: added={} skipped={}",
                    invoker.user_id,
                    req.guild_id,
                    report.added,
                    report.skipped
                );
                let text = describe_report(&cfg.name, req.ghost, &report);
                reply(NotifyOutcome::Delivered(report), text)
            }
            Err(e) => {
                tracing::warn!("[notify] broadcast of `{key}` refused: {e}");
                let text = match &e {
                    BroadcastError::MissingPrivilege => format!("❌ {e}."),
                    _ => format!("❌ Could not notify **{}**: {e}", cfg.name),
                };
                reply(NotifyOutcome::Failed(e.to_string()), text)
            }
        }
    }

    /// Mention a platform role in place. Ghost mode does not apply: the role
    /// already exists and the mention stays visible.
    async fn mention_platform_role(
        &self,
        invoker: &Invoker,
        channel_id: ChannelId,
        target: &PlatformTarget,
        message: Option<String>,
    ) -> NotifyReply {
        let mention = format!("<@&{}>", target.role_id);
        let limit = self.broadcaster.settings().message_limit;
        let chunks = match message.as_deref().filter(|m| !m.trim().is_empty()) {
            Some(body) => split_message(
                body,
                limit.saturating_sub(mention.chars().count() + 1).max(1),
            ),
            None => Vec::new(),
        };
        let first = match chunks.first() {
            Some(body) => format!("{mention} {body}"),
            None => mention,
        };

        let sent = match self
            .platform
            .send(channel_id, &first, MentionPolicy::Group(target.role_id))
            .await
        {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("[notify] failed to mention role {}: {e}", target.role_id);
                return reply(
                    NotifyOutcome::Failed(e.to_string()),
                    format!("❌ Could not mention **{}**: {e}", target.name),
                );
            }
        };
        for chunk in chunks.iter().skip(1) {
            if let Err(e) = self
                .platform
                .send(channel_id, chunk, MentionPolicy::None)
                .await
            {
                tracing::warn!("[notify] role {}: follow-up chunk failed: {e}", target.role_id);
                return reply(
                    NotifyOutcome::Failed(e.to_string()),
                    format!(
                        "⚠️ Mentioned **{}**, but the rest of the message could not be sent: {e}",
                        target.name
                    ),
                );
            }
        }

        tracing::info!(
            "[notify] {} mentioned platform role {} in {channel_id}",
            invoker.user_id,
            target.role_id
        );
        reply(
            NotifyOutcome::RoleMentioned(sent),
            format!("✅ Mentioned **{}**.", target.name),
        )
    }

    async fn post_unsubscribed(
        &self,
        channel_id: ChannelId,
        cfg: &RoleConfig,
        key: &str,
        message: Option<String>,
    ) -> NotifyReply {
        let Some(message) = message else {
            return reply(
                NotifyOutcome::NoSubscribers { posted: false },
                format!("ℹ️ `{key}` has no subscribers; nothing was sent."),
            );
        };

        let body = format!("⚠️ **{}** (no subscribers)\n{message}", cfg.name);
        let limit = self.broadcaster.settings().message_limit;
        for chunk in split_message(&body, limit) {
            if let Err(e) = self
                .platform
                .send(channel_id, &chunk, MentionPolicy::None)
                .await
            {
                tracing::warn!("[notify] failed to post message for `{key}`: {e}");
                return reply(
                    NotifyOutcome::Failed(e.to_string()),
                    format!("❌ `{key}` has no subscribers and the message could not be posted: {e}"),
                );
            }
        }
        reply(
            NotifyOutcome::NoSubscribers { posted: true },
            format!("ℹ️ `{key}` has no subscribers, but your message was posted."),
        )
    }

    /// Ghost-mention every role bound to one of `tags`. Returns the keys
    /// whose subscribers were notified.
    pub async fn notify_tagged(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        tags: &BTreeSet<TagId>,
        status: &dyn StatusSurface,
    ) -> Vec<String> {
        let mut mentioned = Vec::new();
        for (key, cfg) in self.roles.roles_for_tags(guild_id, tags).await {
            let targets = self.subscribers(&key, guild_id).await;
            if targets.is_empty() {
                continue;
            }
            let req = BroadcastRequest {
                guild_id,
                channel_id,
                targets,
                display_name: cfg.name.clone(),
                message: None,
                ghost: true,
            };
            match self.broadcaster.broadcast(&req, status).await {
                Ok(report) if report.delivered() => {
                    tracing::info!(
                        "[notify] thread {channel_id}: ghost-mentioned `{key}` ({} members)",
                        report.added
                    );
                    if let Some(warning) = &report.cleanup_error {
                        tracing::warn!("[notify] {warning}");
                    }
                    mentioned.push(key);
                }
                Ok(report) => {
                    tracing::warn!("[notify] thread {channel_id}: `{key}` not delivered: {:?}", report.failure);
                }
                Err(e) => tracing::warn!("[notify] thread {channel_id}: `{key}` refused: {e}"),
            }
        }
        mentioned
    }

    pub async fn add_role(
        &self,
        invoker: &Invoker,
        guild_id: GuildId,
        draft: RoleDraft,
    ) -> Result<(), RoleConfigRejection> {
        let key = draft.key.trim().to_string();
        let cfg = self.config_from(invoker, draft);
        self.roles.add_role(guild_id, &key, cfg).await
    }

    pub async fn update_role(
        &self,
        invoker: &Invoker,
        guild_id: GuildId,
        old_key: &str,
        draft: RoleDraft,
    ) -> Result<(), RoleConfigRejection> {
        let key = draft.key.trim().to_string();
        let cfg = self.config_from(invoker, draft);
        self.roles.update_role(guild_id, old_key, &key, cfg).await
    }

    /// Remove a role. Its subscriptions are kept so it can be restored.
    pub async fn delete_role(
        &self,
        guild_id: GuildId,
        role_key: &str,
    ) -> Result<(), RoleConfigRejection> {
        self.roles.delete_role(guild_id, role_key).await
    }

    pub async fn reorder_roles(
        &self,
        guild_id: GuildId,
        new_order: Vec<String>,
    ) -> Result<(), RoleConfigRejection> {
        self.roles.update_role_order(guild_id, new_order).await
    }

    fn config_from(&self, invoker: &Invoker, draft: RoleDraft) -> RoleConfig {
        let allowed_publishers = if draft.allowed_publishers.is_empty() && !invoker.is_privileged()
        {
            self.default_publishers.clone()
        } else {
            draft.allowed_publishers
        };
        RoleConfig {
            name: draft.name.trim().to_string(),
            description: draft.description.trim().to_string(),
            allowed_publishers,
            external_tag_id: draft.external_tag_id,
        }
    }
}

fn can_publish(invoker: &Invoker, allowed_publishers: &BTreeSet<RoleId>) -> bool {
    invoker.is_privileged() || !invoker.role_ids.is_disjoint(allowed_publishers)
}

fn choice_label(name: &str, key: &str) -> String {
    let label = if name.is_empty() || name == key {
        key.to_string()
    } else {
        format!("{name} ({key})")
    };
    if label.chars().count() <= MAX_CHOICE_LABEL {
        return label;
    }
    let mut out: String = label.chars().take(MAX_CHOICE_LABEL - 3).collect();
    out.push_str("...");
    out
}

fn describe_report(name: &str, ghost: bool, report: &BroadcastReport) -> String {
    let mut text = match (&report.failure, report.delivered()) {
        (None, _) => format!(
            "✅ {} **{name}**: {} notified, {} skipped.",
            if ghost { "Ghost-mentioned" } else { "Mentioned" },
            report.added,
            report.skipped
        ),
        (Some((stage, msg)), true) => format!(
            "⚠️ Mentioned **{name}** ({} notified, {} skipped), but failed while {stage}: {msg}",
            report.added, report.skipped
        ),
        (Some((stage, msg)), false) => format!(
            "❌ Could not notify **{name}**: failed while {stage}: {msg} ({} added, {} skipped)",
            report.added, report.skipped
        ),
    };
    if let Some(warning) = &report.cleanup_error {
        text.push_str("\n⚠️ ");
        text.push_str(warning);
    }
    text
}

fn reply(outcome: NotifyOutcome, text: String) -> NotifyReply {
    NotifyReply { outcome, text }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broadcast::BroadcastSettings,
        persist::tmp_file,
        testing::{Call, FakePlatform, RecordingStatus},
    };
    use std::time::Duration;

    const G: GuildId = GuildId(1);
    const PUBLISHER: RoleId = RoleId(500);

    struct Harness {
        fake: Arc<FakePlatform>,
        subs: SubscriptionStore,
        svc: MentionService,
    }

    fn harness(members: impl IntoIterator<Item = u64>) -> Harness {
        let fake = Arc::new(FakePlatform::with_members(members));
        let subs = SubscriptionStore::load(tmp_file("newsbot-mention-subs"), Duration::from_secs(60));
        let roles = RoleConfigStore::load(tmp_file("newsbot-mention-roles"), Duration::from_secs(60));
        let svc = MentionService::new(
            subs.clone(),
            roles,
            fake.clone(),
            Broadcaster::new(fake.clone(), BroadcastSettings::default()),
            BTreeSet::from([RoleId(777)]),
        );
        Harness { fake, subs, svc }
    }

    fn publisher() -> Invoker {
        Invoker {
            user_id: UserId(9),
            role_ids: BTreeSet::from([PUBLISHER]),
            ..Default::default()
        }
    }

    fn draft(key: &str, tag: Option<u64>) -> RoleDraft {
        RoleDraft {
            key: key.to_string(),
            name: format!("{key} readers"),
            description: String::new(),
            allowed_publishers: BTreeSet::from([PUBLISHER]),
            external_tag_id: tag.map(TagId),
        }
    }

    fn notify_req(key: &str, message: Option<&str>) -> NotifyRequest {
        NotifyRequest {
            guild_id: G,
            channel_id: ChannelId(42),
            role_key: key.to_string(),
            message: message.map(str::to_string),
            ghost: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_rules() {
        let h = harness([]);
        h.svc.add_role(&publisher(), G, draft("news", None)).await.unwrap();

        assert!(h.svc.is_authorized(&publisher(), "news", G).await);
        let stranger = Invoker {
            user_id: UserId(2),
            role_ids: BTreeSet::from([RoleId(1)]),
            ..Default::default()
        };
        assert!(!h.svc.is_authorized(&stranger, "news", G).await);
        let owner = Invoker {
            is_owner: true,
            ..Default::default()
        };
        assert!(h.svc.is_authorized(&owner, "news", G).await);
        assert!(!h.svc.is_authorized(&owner, "missing", G).await);
    }

    #[tokio::test(start_paused = true)]
    async fn non_privileged_editor_gets_default_publishers() {
        let h = harness([]);
        let mut d = draft("news", None);
        d.allowed_publishers.clear();
        h.svc.add_role(&publisher(), G, d.clone()).await.unwrap();
        assert_eq!(
            h.svc.resolve("news", G).await.unwrap().allowed_publishers,
            BTreeSet::from([RoleId(777)])
        );

        let admin = Invoker {
            is_admin: true,
            ..Default::default()
        };
        d.key = "open".to_string();
        h.svc.add_role(&admin, G, d).await.unwrap();
        assert!(h.svc.resolve("open", G).await.unwrap().allowed_publishers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn autocomplete_filters_and_truncates() {
        let h = harness([]);
        for i in 0..30 {
            h.svc
                .add_role(&publisher(), G, draft(&format!("topic-{i:02}"), None))
                .await
                .unwrap();
        }
        let mut long = draft("long", None);
        long.name = "n".repeat(150);
        h.svc.add_role(&publisher(), G, long).await.unwrap();
        let mut hidden = draft("topic-secret", None);
        hidden.allowed_publishers = BTreeSet::from([RoleId(1)]);
        h.svc.add_role(&publisher(), G, hidden).await.unwrap();

        let all = h.svc.autocomplete(&publisher(), G, "TOPIC").await;
        assert_eq!(all.len(), MAX_AUTOCOMPLETE_CHOICES);
        assert_eq!(all[0].value, "topic-00");
        assert!(all.iter().all(|c| c.value != "topic-secret"));

        let long = h.svc.autocomplete(&publisher(), G, "long").await;
        assert_eq!(long.len(), 1);
        assert_eq!(long[0].label.chars().count(), MAX_CHOICE_LABEL);
        assert!(long[0].label.ends_with("..."));
    }

    fn with_readers_role(svc: MentionService) -> MentionService {
        let target = PlatformTarget {
            role_id: RoleId(900),
            name: "Readers".to_string(),
            allowed_publishers: BTreeSet::from([PUBLISHER]),
        };
        svc.with_platform_targets(BTreeMap::from([(
            G,
            BTreeMap::from([("readers".to_string(), target)]),
        )]))
    }

    #[tokio::test(start_paused = true)]
    async fn platform_role_is_mentioned_without_temporary_role() {
        let Harness { fake, svc, .. } = harness([1, 2, 3]);
        let svc = with_readers_role(svc);
        let status = RecordingStatus::default();

        let mut req = notify_req("readers", Some("big news today"));
        req.ghost = true;
        let r = svc.notify(&publisher(), req, &status).await;
        assert!(matches!(r.outcome, NotifyOutcome::RoleMentioned(_)), "{r:?}");
        assert_eq!(r.text, "✅ Mentioned **Readers**.");

        assert_eq!(
            fake.calls(),
            vec![Call::Send {
                channel_id: ChannelId(42),
                content: "<@&900> big news today".to_string(),
                mentions: MentionPolicy::Group(RoleId(900)),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn platform_role_requires_a_publisher_role() {
        let Harness { fake, svc, .. } = harness([]);
        let svc = with_readers_role(svc);
        let stranger = Invoker {
            user_id: UserId(2),
            role_ids: BTreeSet::from([RoleId(1)]),
            ..Default::default()
        };

        assert!(svc.is_authorized(&publisher(), "readers", G).await);
        assert!(!svc.is_authorized(&stranger, "readers", G).await);
        assert!(!svc.is_authorized(&publisher(), "readers", GuildId(2)).await);

        let r = svc
            .notify(&stranger, notify_req("readers", None), &RecordingStatus::default())
            .await;
        assert_eq!(r.outcome, NotifyOutcome::Unauthorized);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn platform_role_shadows_virtual_role_in_autocomplete() {
        let Harness { svc, .. } = harness([]);
        svc.add_role(&publisher(), G, draft("readers", None)).await.unwrap();
        svc.add_role(&publisher(), G, draft("sports", None)).await.unwrap();
        let svc = with_readers_role(svc);

        let values: Vec<String> = svc
            .autocomplete(&publisher(), G, "")
            .await
            .into_iter()
            .map(|c| c.value)
            .collect();
        assert_eq!(values, vec!["readers", "sports"]);
        assert!(matches!(
            svc.resolve_target("readers", G).await,
            Some(MentionTarget::PlatformRole(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn notify_unknown_and_unauthorized() {
        let h = harness([]);
        h.svc.add_role(&publisher(), G, draft("news", None)).await.unwrap();
        let status = RecordingStatus::default();

        let r = h.svc.notify(&publisher(), notify_req("nope", None), &status).await;
        assert_eq!(r.outcome, NotifyOutcome::NotFound);

        let r = h
            .svc
            .notify(&Invoker::default(), notify_req("news", None), &status)
            .await;
        assert_eq!(r.outcome, NotifyOutcome::Unauthorized);
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notify_without_subscribers_still_posts_message() {
        let h = harness([]);
        h.svc.add_role(&publisher(), G, draft("news", None)).await.unwrap();
        let status = RecordingStatus::default();

        let r = h
            .svc
            .notify(&publisher(), notify_req("news", Some("big story")), &status)
            .await;
        assert_eq!(r.outcome, NotifyOutcome::NoSubscribers { posted: true });
        let sent = h.fake.sent_contents();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("big story"));
        assert_eq!(h.fake.count(|c| matches!(c, Call::CreateGroup(_))), 0);

        let r = h.svc.notify(&publisher(), notify_req("news", None), &status).await;
        assert_eq!(r.outcome, NotifyOutcome::NoSubscribers { posted: false });
    }

    #[tokio::test(start_paused = true)]
    async fn notify_broadcasts_to_subscribers() {
        let h = harness(1..=3);
        h.svc.add_role(&publisher(), G, draft("news", None)).await.unwrap();
        for u in 1..=4 {
            h.subs.add_role_to_user(UserId(u), "news", G).await;
        }

        let r = h
            .svc
            .notify(&publisher(), notify_req("news", Some("hi")), &RecordingStatus::default())
            .await;
        let NotifyOutcome::Delivered(report) = &r.outcome else {
            panic!("unexpected outcome {:?}", r.outcome);
        };
        assert_eq!((report.added, report.skipped), (3, 1));
        assert!(r.text.contains("3 notified, 1 skipped"));
    }

    #[tokio::test(start_paused = true)]
    async fn notify_reports_cleanup_warning() {
        let h = harness(1..=2);
        *h.fake.fail_delete.lock().unwrap() = true;
        h.svc.add_role(&publisher(), G, draft("news", None)).await.unwrap();
        h.subs.add_role_to_user(UserId(1), "news", G).await;

        let r = h
            .svc
            .notify(&publisher(), notify_req("news", None), &RecordingStatus::default())
            .await;
        assert!(r.text.contains("delete it manually"));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_delete_keeps_subscribers() {
        let h = harness([]);
        h.svc.add_role(&publisher(), G, draft("news", None)).await.unwrap();
        h.subs.add_role_to_user(UserId(5), "news", G).await;

        h.svc.delete_role(G, "news").await.unwrap();
        assert!(h.svc.resolve("news", G).await.is_none());
        assert_eq!(h.svc.subscribers("news", G).await, BTreeSet::from([UserId(5)]));
    }

    #[tokio::test(start_paused = true)]
    async fn tagged_thread_notifies_bound_roles() {
        let h = harness(1..=5);
        h.svc.add_role(&publisher(), G, draft("tech", Some(10))).await.unwrap();
        h.svc.add_role(&publisher(), G, draft("art", Some(11))).await.unwrap();
        h.svc.add_role(&publisher(), G, draft("empty", Some(12))).await.unwrap();
        h.subs.add_role_to_user(UserId(1), "tech", G).await;
        h.subs.add_role_to_user(UserId(2), "art", G).await;

        let tags = BTreeSet::from([TagId(10), TagId(12), TagId(99)]);
        let keys = h
            .svc
            .notify_tagged(G, ChannelId(77), &tags, &RecordingStatus::default())
            .await;
        assert_eq!(keys, vec!["tech"]);
        assert_eq!(h.fake.count(|c| matches!(c, Call::CreateGroup(_))), 1);
        assert_eq!(h.fake.count(|c| matches!(c, Call::Edit { .. })), 1);
    }
}
