//! Ordered, per-guild registry of virtual roles.
//!
//! Each guild owns a map `role_key -> RoleConfig` and an explicit order list
//! which is always a permutation of the map's keys. Divergence found on disk
//! (stale or missing order entries) is repaired and persisted.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{GuildId, RoleId, TagId},
    persist::{read_json, write_atomic, DebouncedFlush, Flush},
    Result,
};

/// Longest accepted role key (the platform's autocomplete value limit).
pub const MAX_ROLE_KEY_LEN: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Platform roles whose members may broadcast to this virtual role.
    #[serde(default, alias = "allowed_by_roles")]
    pub allowed_publishers: BTreeSet<RoleId>,
    /// Forum tag bound to this role; tagged threads notify its subscribers.
    #[serde(default, alias = "forum_tag_id")]
    pub external_tag_id: Option<TagId>,
}

/// Why a role-config mutation was refused. `Display` is user-facing.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoleConfigRejection {
    #[error("a virtual role with key `{0}` already exists")]
    KeyExists(String),
    #[error("no virtual role with key `{0}` exists")]
    NotFound(String),
    #[error("the role list changed while you were reordering it; reload and try again")]
    OrderMismatch,
    #[error("role keys must be 1-100 characters and not blank")]
    InvalidKey,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct GuildRoles {
    roles: HashMap<String, RoleConfig>,
    order: Vec<String>,
}

impl GuildRoles {
    /// Make `order` a permutation of `roles`' keys: drop stale and duplicate
    /// entries, append missing keys in sorted order. Returns whether anything
    /// changed.
    fn repair_order(&mut self) -> bool {
        let before = self.order.len();
        let mut seen = BTreeSet::new();
        let roles = &self.roles;
        self.order
            .retain(|k| roles.contains_key(k) && seen.insert(k.clone()));
        let mut changed = self.order.len() != before;

        let mut missing: Vec<String> = self
            .roles
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            missing.sort();
            self.order.extend(missing);
            changed = true;
        }
        changed
    }

    fn ordered(&self) -> Vec<(String, RoleConfig)> {
        self.order
            .iter()
            .filter_map(|k| self.roles.get(k).map(|c| (k.clone(), c.clone())))
            .collect()
    }
}

/// On-disk guild entry: the current `{roles, order}` shape, or the legacy
/// shape that was just `{role_key: config}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum GuildRolesFile {
    Current {
        roles: HashMap<String, RoleConfig>,
        #[serde(default)]
        order: Vec<String>,
    },
    Legacy(HashMap<String, RoleConfig>),
}

#[derive(Default)]
struct RoleConfigState {
    guilds: BTreeMap<GuildId, GuildRoles>,
    dirty: bool,
    revision: u64,
}

impl RoleConfigState {
    fn touch(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }
}

struct RoleConfigInner {
    path: PathBuf,
    state: Mutex<RoleConfigState>,
    flusher: DebouncedFlush,
    /// Held from snapshot to rename so a deferred flush and `flush_now`
    /// never interleave on the temp file.
    write_guard: Mutex<()>,
    writes: AtomicU64,
}

#[async_trait]
impl Flush for RoleConfigInner {
    async fn flush(&self) -> Result<()> {
        let _write = self.write_guard.lock().await;
        let (bytes, revision) = {
            let st = self.state.lock().await;
            if !st.dirty {
                return Ok(());
            }
            (serde_json::to_vec_pretty(&st.guilds)?, st.revision)
        };

        write_atomic(&self.path, &bytes)?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut st = self.state.lock().await;
        if st.revision == revision {
            st.dirty = false;
        }
        tracing::debug!("[role-config] saved {}", self.path.display());
        Ok(())
    }

    fn label(&self) -> &'static str {
        "role-config"
    }
}

/// Process-wide role configuration store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RoleConfigStore {
    inner: Arc<RoleConfigInner>,
}

impl RoleConfigStore {
    /// Load from `path`, repairing order lists and migrating the legacy file
    /// shape. Repairs are written back synchronously before returning.
    pub fn load(path: impl Into<PathBuf>, flush_delay: Duration) -> Self {
        let path = path.into();
        let raw: BTreeMap<GuildId, GuildRolesFile> =
            read_json(&path, "role-config").unwrap_or_default();

        let mut repaired = false;
        let mut guilds = BTreeMap::new();
        for (guild_id, entry) in raw {
            let mut g = match entry {
                GuildRolesFile::Current { roles, order } => GuildRoles { roles, order },
                GuildRolesFile::Legacy(roles) => {
                    repaired = true;
                    GuildRoles {
                        roles,
                        order: Vec::new(),
                    }
                }
            };
            if g.repair_order() {
                tracing::warn!("[role-config] repaired role order for guild {guild_id}");
                repaired = true;
            }
            if !g.roles.is_empty() {
                guilds.insert(guild_id, g);
            }
        }

        let roles: usize = guilds.values().map(|g| g.roles.len()).sum();
        tracing::info!(
            "[role-config] loaded {roles} virtual roles across {} guilds from {}",
            guilds.len(),
            path.display()
        );

        let mut state = RoleConfigState {
            guilds,
            dirty: false,
            revision: 0,
        };
        let mut writes = 0;
        if repaired {
            match serde_json::to_vec_pretty(&state.guilds)
                .map_err(crate::Error::from)
                .and_then(|bytes| write_atomic(&path, &bytes).map_err(crate::Error::from))
            {
                Ok(()) => writes = 1,
                Err(e) => {
                    tracing::error!("[role-config] failed to persist repaired config: {e}");
                    state.touch();
                }
            }
        }

        Self {
            inner: Arc::new(RoleConfigInner {
                path,
                state: Mutex::new(state),
                flusher: DebouncedFlush::new(flush_delay),
                write_guard: Mutex::new(()),
                writes: AtomicU64::new(writes),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn schedule_save(&self) {
        self.inner.flusher.schedule(self.inner.clone());
    }

    /// Guilds that have at least one virtual role.
    pub async fn list_guilds(&self) -> Vec<GuildId> {
        self.inner.state.lock().await.guilds.keys().copied().collect()
    }

    /// All roles of the guild in their configured order.
    pub async fn get_guild_roles_ordered(&self, guild_id: GuildId) -> Vec<(String, RoleConfig)> {
        let (out, repaired) = {
            let mut st = self.inner.state.lock().await;
            let Some(g) = st.guilds.get_mut(&guild_id) else {
                return Vec::new();
            };
            let repaired = g.repair_order();
            let out = g.ordered();
            if repaired {
                st.touch();
            }
            (out, repaired)
        };
        if repaired {
            tracing::warn!("[role-config] repaired role order for guild {guild_id}");
            self.schedule_save();
        }
        out
    }

    pub async fn get_role_config(&self, guild_id: GuildId, role_key: &str) -> Option<RoleConfig> {
        let st = self.inner.state.lock().await;
        st.guilds
            .get(&guild_id)
            .and_then(|g| g.roles.get(role_key))
            .cloned()
    }

    /// Roles bound to any of `tags`, in configured order.
    pub async fn roles_for_tags(
        &self,
        guild_id: GuildId,
        tags: &BTreeSet<TagId>,
    ) -> Vec<(String, RoleConfig)> {
        let st = self.inner.state.lock().await;
        let Some(g) = st.guilds.get(&guild_id) else {
            return Vec::new();
        };
        g.ordered()
            .into_iter()
            .filter(|(_, c)| c.external_tag_id.is_some_and(|t| tags.contains(&t)))
            .collect()
    }

    /// Insert a new role at the end of the order.
    pub async fn add_role(
        &self,
        guild_id: GuildId,
        role_key: &str,
        config: RoleConfig,
    ) -> std::result::Result<(), RoleConfigRejection> {
        validate_key(role_key)?;
        {
            let mut st = self.inner.state.lock().await;
            let g = st.guilds.entry(guild_id).or_default();
            if g.roles.contains_key(role_key) {
                return Err(RoleConfigRejection::KeyExists(role_key.to_string()));
            }
            g.roles.insert(role_key.to_string(), config);
            g.order.push(role_key.to_string());
            st.touch();
        }
        tracing::info!("[role-config] guild {guild_id}: added role `{role_key}`");
        self.schedule_save();
        Ok(())
    }

    /// Replace (and optionally rename) a role, keeping its order position.
    pub async fn update_role(
        &self,
        guild_id: GuildId,
        old_key: &str,
        new_key: &str,
        config: RoleConfig,
    ) -> std::result::Result<(), RoleConfigRejection> {
        validate_key(new_key)?;
        {
            let mut st = self.inner.state.lock().await;
            let Some(g) = st.guilds.get_mut(&guild_id) else {
                return Err(RoleConfigRejection::NotFound(old_key.to_string()));
            };
            if !g.roles.contains_key(old_key) {
                return Err(RoleConfigRejection::NotFound(old_key.to_string()));
            }
            if new_key != old_key && g.roles.contains_key(new_key) {
                return Err(RoleConfigRejection::KeyExists(new_key.to_string()));
            }

            g.roles.remove(old_key);
            g.roles.insert(new_key.to_string(), config);
            match g.order.iter_mut().find(|k| k.as_str() == old_key) {
                Some(slot) => *slot = new_key.to_string(),
                None => g.order.push(new_key.to_string()),
            }
            st.touch();
        }
        if old_key != new_key {
            tracing::info!("[role-config] guild {guild_id}: renamed `{old_key}` to `{new_key}`");
        } else {
            tracing::info!("[role-config] guild {guild_id}: updated `{new_key}`");
        }
        self.schedule_save();
        Ok(())
    }

    /// Remove a role's configuration. Subscriptions to the key are left in
    /// place so the role can be restored later.
    pub async fn delete_role(
        &self,
        guild_id: GuildId,
        role_key: &str,
    ) -> std::result::Result<(), RoleConfigRejection> {
        {
            let mut st = self.inner.state.lock().await;
            let Some(g) = st.guilds.get_mut(&guild_id) else {
                return Err(RoleConfigRejection::NotFound(role_key.to_string()));
            };
            if g.roles.remove(role_key).is_none() {
                return Err(RoleConfigRejection::NotFound(role_key.to_string()));
            }
            g.order.retain(|k| k != role_key);
            if g.roles.is_empty() {
                st.guilds.remove(&guild_id);
            }
            st.touch();
        }
        tracing::info!("[role-config] guild {guild_id}: deleted role `{role_key}`");
        self.schedule_save();
        Ok(())
    }

    /// Replace the order list. `new_order` must contain exactly the current
    /// keys.
    pub async fn update_role_order(
        &self,
        guild_id: GuildId,
        new_order: Vec<String>,
    ) -> std::result::Result<(), RoleConfigRejection> {
        {
            let mut st = self.inner.state.lock().await;
            let current: BTreeSet<&String> = st
                .guilds
                .get(&guild_id)
                .map(|g| g.roles.keys().collect())
                .unwrap_or_default();
            let proposed: BTreeSet<&String> = new_order.iter().collect();
            if current.is_empty() || proposed != current || proposed.len() != new_order.len() {
                return Err(RoleConfigRejection::OrderMismatch);
            }
            if let Some(g) = st.guilds.get_mut(&guild_id) {
                g.order = new_order;
            }
            st.touch();
        }
        self.schedule_save();
        Ok(())
    }

    /// Cancel any pending deferred flush and write now if dirty.
    pub async fn flush_now(&self) -> Result<()> {
        self.inner.flusher.cancel();
        self.inner.flush().await
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.state.lock().await.dirty
    }

    /// Number of completed disk writes since load (including a load repair).
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }
}

fn validate_key(key: &str) -> std::result::Result<(), RoleConfigRejection> {
    if key.trim().is_empty() || key.chars().count() > MAX_ROLE_KEY_LEN {
        return Err(RoleConfigRejection::InvalidKey);
    }
    Ok(())
}
