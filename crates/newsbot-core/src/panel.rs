//! Self-service subscription panel: what a member sees when managing their
//! virtual roles, and the toggle behind each button.

use crate::{
    domain::{GuildId, UserId},
    role_config::{RoleConfigRejection, RoleConfigStore},
    subscriptions::SubscriptionStore,
};

/// Custom id of the persistent "manage my notifications" button.
pub const OPEN_PANEL_CUSTOM_ID: &str = "open_virtual_role_manager";

const TOGGLE_PREFIX: &str = "toggle_virtual_role:";
/// Buttons a single message can carry (5 rows of 5).
pub const MAX_PANEL_BUTTONS: usize = 25;
const MAX_BUTTON_LABEL: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanelButton {
    pub custom_id: String,
    pub label: String,
    pub subscribed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanelView {
    pub title: String,
    pub body: String,
    pub buttons: Vec<PanelButton>,
}

impl PanelView {
    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToggleOutcome {
    /// Subscription state after the toggle.
    pub subscribed: bool,
    pub view: PanelView,
}

pub fn toggle_custom_id(role_key: &str) -> String {
    format!("{TOGGLE_PREFIX}{role_key}")
}

pub fn parse_toggle_custom_id(custom_id: &str) -> Option<&str> {
    custom_id
        .strip_prefix(TOGGLE_PREFIX)
        .filter(|k| !k.is_empty())
}

#[derive(Clone)]
pub struct SubscriptionPanel {
    subscriptions: SubscriptionStore,
    roles: RoleConfigStore,
}

impl SubscriptionPanel {
    pub fn new(subscriptions: SubscriptionStore, roles: RoleConfigStore) -> Self {
        Self {
            subscriptions,
            roles,
        }
    }

    pub async fn render(&self, guild_id: GuildId, user_id: UserId) -> PanelView {
        let roles = self.roles.get_guild_roles_ordered(guild_id).await;
        if roles.is_empty() {
            return PanelView {
                title: "No notification groups".to_string(),
                body: "This server has no notification groups configured yet.".to_string(),
                buttons: Vec::new(),
            };
        }

        let mine = self.subscriptions.get_user_roles(user_id, guild_id).await;
        let mut lines = vec!["Use the buttons below to join or leave a notification group.\n".to_string()];
        let mut buttons = Vec::new();
        for (key, cfg) in &roles {
            let subscribed = mine.contains(key);
            let mark = if subscribed { "✅" } else { "❌" };
            if cfg.description.is_empty() {
                lines.push(format!("{mark} **{}**", cfg.name));
            } else {
                lines.push(format!("{mark} **{}**\n └ {}", cfg.name, cfg.description));
            }
            if buttons.len() < MAX_PANEL_BUTTONS {
                buttons.push(PanelButton {
                    custom_id: toggle_custom_id(key),
                    label: cfg.name.chars().take(MAX_BUTTON_LABEL).collect(),
                    subscribed,
                });
            }
        }
        if roles.len() > MAX_PANEL_BUTTONS {
            tracing::warn!(
                "[panel] guild {guild_id} has {} roles; only the first {MAX_PANEL_BUTTONS} get buttons",
                roles.len()
            );
        }

        PanelView {
            title: "🔔 Notification groups".to_string(),
            body: lines.join("\n"),
            buttons,
        }
    }

    /// Flip the user's subscription to `role_key` and re-render.
    ///
    /// Keys without configuration can still be left but not joined.
    pub async fn toggle(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        role_key: &str,
    ) -> Result<ToggleOutcome, RoleConfigRejection> {
        let subscribed_now = self
            .subscriptions
            .get_user_roles(user_id, guild_id)
            .await
            .contains(role_key);

        let subscribed = if subscribed_now {
            self.subscriptions
                .remove_role_from_user(user_id, role_key, guild_id)
                .await;
            false
        } else {
            if self.roles.get_role_config(guild_id, role_key).await.is_none() {
                return Err(RoleConfigRejection::NotFound(role_key.to_string()));
            }
            self.subscriptions
                .add_role_to_user(user_id, role_key, guild_id)
                .await;
            true
        };
        tracing::debug!(
            "[panel] guild {guild_id}: {user_id} {} `{role_key}`",
            if subscribed { "joined" } else { "left" }
        );

        Ok(ToggleOutcome {
            subscribed,
            view: self.render(guild_id, user_id).await,
        })
    }
}
