use std::{
    collections::{BTreeMap, BTreeSet},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{GuildId, RoleId},
    errors::Error,
    housekeeping::ForumSettings,
    mention::PlatformTarget,
    Result,
};

/// Typed configuration for the bot, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Platform
    pub discord_bot_token: String,
    pub discord_api_base: String,
    pub discord_proxy: Option<String>,
    pub guild_ids: Vec<GuildId>,

    // Persistence
    pub data_dir: PathBuf,
    pub subscriptions_file: PathBuf,
    pub role_config_file: PathBuf,
    pub subscription_flush_delay: Duration,
    pub role_config_flush_delay: Duration,

    // Broadcast
    pub message_limit: usize,
    pub ghost_delay: Duration,
    pub progress_interval: Duration,
    pub default_publishers: BTreeSet<RoleId>,

    // Outbound throttle
    pub global_min_interval: Duration,
    pub per_channel_min_interval: Duration,

    // Forum housekeeping
    pub forum: BTreeMap<GuildId, ForumSettings>,

    // Platform roles that may be mentioned directly, per guild and key.
    pub mention_targets: BTreeMap<GuildId, BTreeMap<String, PlatformTarget>>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let discord_bot_token = env_str("DISCORD_BOT_TOKEN").unwrap_or_default();
        if discord_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "DISCORD_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let discord_api_base = env_str("DISCORD_API_BASE")
            .and_then(non_empty)
            .unwrap_or_else(|| "https://discord.com/api/v10".to_string());
        let discord_proxy = env_str("DISCORD_BOT_PROXY").and_then(non_empty);
        let guild_ids = parse_csv_ids(env_str("GUILD_IDS"));

        let data_dir = env_path("DATA_DIR").unwrap_or_else(|| PathBuf::from("data"));
        fs::create_dir_all(&data_dir)?;
        let subscriptions_file = env_path("SUBSCRIPTIONS_FILE")
            .unwrap_or_else(|| data_dir.join("user_virtual_roles.json"));
        let role_config_file = env_path("ROLE_CONFIG_FILE")
            .unwrap_or_else(|| data_dir.join("virtual_roles_config.json"));

        let subscription_flush_delay =
            Duration::from_millis(env_u64("SUBSCRIPTION_FLUSH_DELAY_MS").unwrap_or(1500));
        let role_config_flush_delay =
            Duration::from_millis(env_u64("ROLE_CONFIG_FLUSH_DELAY_MS").unwrap_or(2000));

        let message_limit = env_usize("MESSAGE_LIMIT").unwrap_or(2000).max(100);
        let ghost_delay = Duration::from_millis(env_u64("GHOST_DELAY_MS").unwrap_or(2000));
        let progress_interval =
            Duration::from_millis(env_u64("PROGRESS_INTERVAL_MS").unwrap_or(1500));
        let default_publishers = parse_csv_ids(env_str("DEFAULT_PUBLISHER_ROLE_IDS"))
            .into_iter()
            .collect();

        let global_min_interval =
            Duration::from_millis(env_u64("GLOBAL_MIN_INTERVAL_MS").unwrap_or(40));
        let per_channel_min_interval =
            Duration::from_millis(env_u64("PER_CHANNEL_MIN_INTERVAL_MS").unwrap_or(1050));

        let forum = match env_path("FORUM_CONFIG_FILE") {
            Some(path) => load_forum_settings(&path)?,
            None => BTreeMap::new(),
        };
        let mention_targets = match env_path("MENTION_TARGETS_FILE") {
            Some(path) => load_mention_targets(&path)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            discord_bot_token,
            discord_api_base,
            discord_proxy,
            guild_ids,
            data_dir,
            subscriptions_file,
            role_config_file,
            subscription_flush_delay,
            role_config_flush_delay,
            message_limit,
            ghost_delay,
            progress_interval,
            default_publishers,
            global_min_interval,
            per_channel_min_interval,
            forum,
            mention_targets,
        })
    }
}

/// Read the per-guild forum settings file (`{ "<guild id>": { ... } }`).
pub fn load_forum_settings(path: &Path) -> Result<BTreeMap<GuildId, ForumSettings>> {
    read_guild_map(path, "forum config")
}

/// Read the mention targets file
/// (`{ "<guild id>": { "<key>": { "role_id": ..., "name": ..., "allowed_publishers": [...] } } }`).
pub fn load_mention_targets(
    path: &Path,
) -> Result<BTreeMap<GuildId, BTreeMap<String, PlatformTarget>>> {
    read_guild_map(path, "mention targets")
}

fn read_guild_map<T: serde::de::DeserializeOwned>(
    path: &Path,
    what: &str,
) -> Result<BTreeMap<GuildId, T>> {
    let txt = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {what} {}: {e}", path.display())))?;
    if txt.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&txt)
        .map_err(|e| Error::Config(format!("invalid {what} {}: {e}", path.display())))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv_ids<T: std::str::FromStr>(v: Option<String>) -> Vec<T> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<T>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
