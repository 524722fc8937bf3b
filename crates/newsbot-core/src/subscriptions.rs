//! Virtual-role subscription store.
//!
//! Forward map `guild -> user -> {role_key}` plus a reverse index
//! `guild -> role_key -> {user}`. Only the forward map is persisted; the
//! reverse index is rebuilt from it on load. Both maps live behind one lock so
//! they are always observed in sync.

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
use tokio::sync::Mutex;

use crate::{
    domain::{GuildId, UserId},
    persist::{read_json, write_atomic, DebouncedFlush, Flush},
    Result,
};

type ForwardMap = BTreeMap<GuildId, BTreeMap<UserId, BTreeSet<String>>>;
type ReverseIndex = HashMap<GuildId, HashMap<String, BTreeSet<UserId>>>;

#[derive(Default)]
struct SubscriptionState {
    forward: ForwardMap,
    reverse: ReverseIndex,
    dirty: bool,
    revision: u64,
}

impl SubscriptionState {
    fn from_forward(forward: ForwardMap) -> Self {
        let mut reverse: ReverseIndex = HashMap::new();
        for (guild_id, users) in &forward {
            for (user_id, keys) in users {
                for key in keys {
                    reverse
                        .entry(*guild_id)
                        .or_default()
                        .entry(key.clone())
                        .or_default()
                        .insert(*user_id);
                }
            }
        }
        Self {
            forward,
            reverse,
            dirty: false,
            revision: 0,
        }
    }

    fn insert(&mut self, guild_id: GuildId, user_id: UserId, role_key: &str) -> bool {
        let inserted = self
            .forward
            .entry(guild_id)
            .or_default()
            .entry(user_id)
            .or_default()
            .insert(role_key.to_string());
        if !inserted {
            return false;
        }

        self.reverse
            .entry(guild_id)
            .or_default()
            .entry(role_key.to_string())
            .or_default()
            .insert(user_id);
        self.touch();
        true
    }

    fn remove(&mut self, guild_id: GuildId, user_id: UserId, role_key: &str) -> bool {
        let Some(users) = self.forward.get_mut(&guild_id) else {
            return false;
        };
        let Some(keys) = users.get_mut(&user_id) else {
            return false;
        };
        if !keys.remove(role_key) {
            return false;
        }
        if keys.is_empty() {
            users.remove(&user_id);
        }
        if users.is_empty() {
            self.forward.remove(&guild_id);
        }

        if let Some(index) = self.reverse.get_mut(&guild_id) {
            if let Some(members) = index.get_mut(role_key) {
                members.remove(&user_id);
                if members.is_empty() {
                    index.remove(role_key);
                }
            }
            if index.is_empty() {
                self.reverse.remove(&guild_id);
            }
        }
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }
}

struct SubscriptionInner {
    path: PathBuf,
    state: Mutex<SubscriptionState>,
    flusher: DebouncedFlush,
    /// Held from snapshot to rename so a deferred flush and `flush_now`
    /// never interleave on the temp file.
    write_guard: Mutex<()>,
    writes: AtomicU64,
}

#[async_trait]
impl Flush for SubscriptionInner {
    async fn flush(&self) -> Result<()> {
        let _write = self.write_guard.lock().await;
        let (bytes, revision) = {
            let st = self.state.lock().await;
            if !st.dirty {
                return Ok(());
            }
            (serde_json::to_vec_pretty(&st.forward)?, st.revision)
        };

        write_atomic(&self.path, &bytes)?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut st = self.state.lock().await;
        if st.revision == revision {
            st.dirty = false;
        }
        tracing::debug!("[subscriptions] saved {}", self.path.display());
        Ok(())
    }

    fn label(&self) -> &'static str {
        "subscriptions"
    }
}

/// Process-wide subscription store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SubscriptionStore {
    inner: Arc<SubscriptionInner>,
}

impl SubscriptionStore {
    /// Load the store from `path`. A missing or corrupt file yields an empty
    /// store.
    pub fn load(path: impl Into<PathBuf>, flush_delay: Duration) -> Self {
        let path = path.into();
        let forward: ForwardMap = read_json(&path, "subscriptions").unwrap_or_default();
        let state = SubscriptionState::from_forward(forward);

        let users: usize = state.forward.values().map(|u| u.len()).sum();
        tracing::info!(
            "[subscriptions] loaded {users} subscribers across {} guilds from {}",
            state.forward.len(),
            path.display()
        );

        Self {
            inner: Arc::new(SubscriptionInner {
                path,
                state: Mutex::new(state),
                flusher: DebouncedFlush::new(flush_delay),
                write_guard: Mutex::new(()),
                writes: AtomicU64::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The user's subscribed role keys; empty if none are recorded.
    pub async fn get_user_roles(&self, user_id: UserId, guild_id: GuildId) -> BTreeSet<String> {
        let st = self.inner.state.lock().await;
        st.forward
            .get(&guild_id)
            .and_then(|users| users.get(&user_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Reverse-index lookup; empty if nobody subscribed.
    pub async fn get_users_in_role(&self, role_key: &str, guild_id: GuildId) -> BTreeSet<UserId> {
        let st = self.inner.state.lock().await;
        st.reverse
            .get(&guild_id)
            .and_then(|index| index.get(role_key))
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribe. Idempotent; returns whether anything changed.
    pub async fn add_role_to_user(&self, user_id: UserId, role_key: &str, guild_id: GuildId) -> bool {
        let changed = {
            let mut st = self.inner.state.lock().await;
            st.insert(guild_id, user_id, role_key)
        };
        if changed {
            self.inner.flusher.schedule(self.inner.clone());
        }
        changed
    }

    /// Unsubscribe. Idempotent; returns whether anything changed.
    pub async fn remove_role_from_user(
        &self,
        user_id: UserId,
        role_key: &str,
        guild_id: GuildId,
    ) -> bool {
        let changed = {
            let mut st = self.inner.state.lock().await;
            st.remove(guild_id, user_id, role_key)
        };
        if changed {
            self.inner.flusher.schedule(self.inner.clone());
        }
        changed
    }

    /// Cancel any pending deferred flush and write now if dirty.
    pub async fn flush_now(&self) -> Result<()> {
        self.inner.flusher.cancel();
        self.inner.flush().await
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.state.lock().await.dirty
    }

    /// Number of completed disk writes since load.
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::tmp_file;
    use tokio::time::sleep;

    const G: GuildId = GuildId(1);

    fn store() -> SubscriptionStore {
        SubscriptionStore::load(tmp_file("newsbot-subs"), Duration::from_millis(1500))
    }

    async fn assert_index_in_sync(s: &SubscriptionStore) {
        let st = s.inner.state.lock().await;
        for (guild, users) in &st.forward {
            for (user, keys) in users {
                for key in keys {
                    assert!(st.reverse[guild][key].contains(user));
                }
            }
        }
        for (guild, index) in &st.reverse {
            for (key, users) in index {
                assert!(!users.is_empty());
                for user in users {
                    assert!(st.forward[guild][user].contains(key));
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn add_and_remove_keep_index_in_sync() {
        let s = store();
        let ops: [(bool, u64, &str); 8] = [
            (true, 1, "news"),
            (true, 2, "news"),
            (true, 1, "events"),
            (false, 2, "news"),
            (true, 3, "events"),
            (false, 1, "news"),
            (false, 9, "news"),
            (true, 2, "events"),
        ];
        for (add, user, key) in ops {
            if add {
                s.add_role_to_user(UserId(user), key, G).await;
            } else {
                s.remove_role_from_user(UserId(user), key, G).await;
            }
            assert_index_in_sync(&s).await;
        }

        assert!(s.get_users_in_role("news", G).await.is_empty());
        assert_eq!(
            s.get_users_in_role("events", G).await,
            BTreeSet::from([UserId(1), UserId(2), UserId(3)])
        );
        assert_eq!(
            s.get_user_roles(UserId(1), G).await,
            BTreeSet::from(["events".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn add_is_idempotent_and_remove_of_non_member_is_noop() {
        let s = store();
        assert!(s.add_role_to_user(UserId(5), "news", G).await);
        assert!(!s.add_role_to_user(UserId(5), "news", G).await);
        assert_eq!(s.get_users_in_role("news", G).await.len(), 1);

        assert!(!s.remove_role_from_user(UserId(6), "news", G).await);
        assert!(!s.remove_role_from_user(UserId(5), "other", G).await);
        assert_eq!(s.get_users_in_role("news", G).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_containers_are_pruned() {
        let s = store();
        s.add_role_to_user(UserId(5), "news", G).await;
        s.remove_role_from_user(UserId(5), "news", G).await;

        let st = s.inner.state.lock().await;
        assert!(st.forward.is_empty());
        assert!(st.reverse.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn guilds_are_partitioned() {
        let s = store();
        s.add_role_to_user(UserId(5), "news", GuildId(1)).await;
        assert!(s.get_users_in_role("news", GuildId(2)).await.is_empty());
        assert!(s.get_user_roles(UserId(5), GuildId(2)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_coalesced_into_one_write_and_reloads() {
        let s = store();
        for user in 0..20 {
            s.add_role_to_user(UserId(user), "news", G).await;
        }
        assert_eq!(s.writes(), 0);
        assert!(s.is_dirty().await);

        sleep(Duration::from_millis(3000)).await;
        assert_eq!(s.writes(), 1);
        assert!(!s.is_dirty().await);

        let reloaded = SubscriptionStore::load(s.path(), Duration::from_millis(1500));
        assert_eq!(reloaded.get_users_in_role("news", G).await.len(), 20);
        assert_eq!(
            reloaded.get_user_roles(UserId(3), G).await,
            BTreeSet::from(["news".to_string()])
        );

        let _ = std::fs::remove_file(s.path());
    }

    #[tokio::test]
    async fn flush_now_writes_pending_changes() {
        let s = SubscriptionStore::load(tmp_file("newsbot-subs"), Duration::from_secs(3600));
        s.add_role_to_user(UserId(1), "news", G).await;
        s.flush_now().await.unwrap();
        assert_eq!(s.writes(), 1);

        let txt = std::fs::read_to_string(s.path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&txt).unwrap();
        assert_eq!(v["1"]["1"], serde_json::json!(["news"]));

        // Nothing dirty: no second write.
        s.flush_now().await.unwrap();
        assert_eq!(s.writes(), 1);
        let _ = std::fs::remove_file(s.path());
    }

    #[tokio::test]
    async fn failed_write_keeps_store_dirty() {
        let dir = tmp_file("newsbot-subs-dir");
        std::fs::create_dir_all(&dir).unwrap();
        // The target path is a directory, so the rename fails.
        let s = SubscriptionStore::load(&dir, Duration::from_secs(3600));
        s.add_role_to_user(UserId(1), "news", G).await;
        assert!(s.flush_now().await.is_err());
        assert!(s.is_dirty().await);
        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_file(crate::persist::tmp_sibling(&dir));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_flushes_are_serialized() {
        let s = SubscriptionStore::load(tmp_file("newsbot-subs-race"), Duration::from_secs(3600));
        let tasks: Vec<_> = (0..32u64)
            .map(|i| {
                let s = s.clone();
                tokio::spawn(async move {
                    s.add_role_to_user(UserId(i), "news", G).await;
                    s.inner.flush().await
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        s.flush_now().await.unwrap();
        assert!(!s.is_dirty().await);
        assert!(!crate::persist::tmp_sibling(s.path()).exists());

        let reloaded = SubscriptionStore::load(s.path(), Duration::from_secs(60));
        assert_eq!(reloaded.get_users_in_role("news", G).await.len(), 32);
        let _ = std::fs::remove_file(s.path());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let path = tmp_file("newsbot-subs");
        std::fs::write(&path, "[1, 2").unwrap();
        let s = SubscriptionStore::load(&path, Duration::from_millis(10));
        assert!(s.get_users_in_role("news", G).await.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
