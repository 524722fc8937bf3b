use std::sync::Arc;

use crate::{
    broadcast::{BroadcastSettings, Broadcaster},
    config::Config,
    housekeeping::{ForumHousekeeper, HousekeepingScheduler},
    mention::MentionService,
    panel::SubscriptionPanel,
    platform::{port::Platform, throttled::ThrottleConfig},
    role_config::RoleConfigStore,
    subscriptions::SubscriptionStore,
    Result,
};

/// Process-wide state, built once at startup and shared by `Arc`.
pub struct AppContext {
    pub config: Arc<Config>,
    pub subscriptions: SubscriptionStore,
    pub roles: RoleConfigStore,
}

impl AppContext {
    /// Load both stores (repairing the role config if needed).
    pub fn load(config: Config) -> Self {
        let subscriptions =
            SubscriptionStore::load(&config.subscriptions_file, config.subscription_flush_delay);
        let roles = RoleConfigStore::load(&config.role_config_file, config.role_config_flush_delay);
        Self {
            config: Arc::new(config),
            subscriptions,
            roles,
        }
    }

    pub fn broadcast_settings(&self) -> BroadcastSettings {
        BroadcastSettings {
            ghost_delay: self.config.ghost_delay,
            progress_interval: self.config.progress_interval,
            message_limit: self.config.message_limit,
        }
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            global_min_interval: self.config.global_min_interval,
            per_channel_min_interval: self.config.per_channel_min_interval,
        }
    }

    pub fn mention_service(&self, platform: Arc<dyn Platform>) -> MentionService {
        MentionService::new(
            self.subscriptions.clone(),
            self.roles.clone(),
            platform.clone(),
            Broadcaster::new(platform, self.broadcast_settings()),
            self.config.default_publishers.clone(),
        )
        .with_platform_targets(self.config.mention_targets.clone())
    }

    pub fn panel(&self) -> SubscriptionPanel {
        SubscriptionPanel::new(self.subscriptions.clone(), self.roles.clone())
    }

    pub fn housekeeping(&self, platform: Arc<dyn Platform>) -> HousekeepingScheduler {
        HousekeepingScheduler::new(ForumHousekeeper::new(platform), self.config.forum.clone())
    }

    /// Force out any pending writes of both stores.
    pub async fn shutdown(&self) -> Result<()> {
        let subs = self.subscriptions.flush_now().await;
        let roles = self.roles.flush_now().await;
        if let Err(e) = &subs {
            tracing::error!("[shutdown] failed to save subscriptions: {e}");
        }
        if let Err(e) = &roles {
            tracing::error!("[shutdown] failed to save role config: {e}");
        }
        tracing::info!("[shutdown] stores flushed");
        subs.and(roles)
    }
}
