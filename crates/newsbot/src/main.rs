use std::sync::Arc;

use anyhow::Context;
use newsbot_core::{
    config::Config,
    context::AppContext,
    domain::GuildId,
    platform::{
        port::{GroupingPort, Platform},
        throttled::ThrottledPlatform,
    },
};
use newsbot_discord::DiscordClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    newsbot_core::logging::init("newsbot")?;

    let cfg = Config::load()?;
    let discord = DiscordClient::from_config(&cfg)?;
    let ctx = AppContext::load(cfg);
    let platform: Arc<dyn Platform> =
        Arc::new(ThrottledPlatform::new(Arc::new(discord), ctx.throttle_config()));

    let housekeeping = ctx.housekeeping(platform.clone());

    // `newsbot housekeep <guild id>` runs one pass and exits.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [cmd, guild] = args.as_slice() {
        if cmd == "housekeep" {
            let guild_id: GuildId = guild.parse().context("guild id must be a number")?;
            match housekeeping.run_now(guild_id).await {
                Some(summary) => tracing::info!("[forum] {guild_id}: {summary:?}"),
                None => tracing::warn!("[forum] {guild_id}: no forum settings configured"),
            }
            ctx.shutdown().await?;
            return Ok(());
        }
    }

    for &guild_id in &ctx.config.guild_ids {
        match platform.can_manage_groups(guild_id).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "[broadcast] guild {guild_id}: missing Manage Roles; mentions will be refused"
            ),
            Err(e) => tracing::warn!("[broadcast] guild {guild_id}: privilege check failed: {e}"),
        }
        let roles = ctx.roles.get_guild_roles_ordered(guild_id).await;
        tracing::info!(
            "[role-config] guild {guild_id}: {} notification groups",
            roles.len()
        );
    }

    let jobs = housekeeping.start().await;
    tracing::info!("[forum] {jobs} housekeeping job(s) scheduled");

    wait_for_shutdown().await;

    housekeeping.stop().await;
    ctx.shutdown().await?;
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("[shutdown] cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("[shutdown] signal received");
}
