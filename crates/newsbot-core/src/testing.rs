//! In-memory platform used by unit tests.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChannelId, GuildId, MessageId, MessageRef, RoleId, UserId},
    platform::{
        port::{ForumPort, GroupingPort, MemberDirectory, MessageSurface, StatusSurface},
        types::{ForumThread, GroupHandle, GroupSpec, MentionPolicy, NewThread, ThreadEdit},
    },
    Error, Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    MemberIds(GuildId),
    CreateGroup(GroupSpec),
    Assign(RoleId, UserId),
    SetMentionable(RoleId, bool),
    DeleteGroup(RoleId),
    Send {
        channel_id: ChannelId,
        content: String,
        mentions: MentionPolicy,
    },
    Edit {
        msg: MessageRef,
        content: String,
        mentions: MentionPolicy,
    },
    CreateThread(ChannelId, NewThread),
    EditThread(ChannelId, ThreadEdit),
}

fn forbidden(what: &str) -> Error {
    Error::Platform {
        status: 403,
        message: format!("missing permissions: {what}"),
    }
}

pub(crate) struct FakePlatform {
    next_id: AtomicU64,
    pub calls: Mutex<Vec<Call>>,
    pub members: Mutex<BTreeSet<UserId>>,
    pub can_manage: Mutex<bool>,
    pub fail_privilege_check: Mutex<bool>,
    pub fail_members: Mutex<bool>,
    pub fail_create: Mutex<bool>,
    pub fail_assign: Mutex<BTreeSet<UserId>>,
    pub fail_send: Mutex<bool>,
    pub fail_delete: Mutex<bool>,
    pub fail_thread_edit: Mutex<BTreeSet<ChannelId>>,
    pub active: Mutex<Vec<ForumThread>>,
    pub archived: Mutex<Vec<ForumThread>>,
    pub now: Mutex<DateTime<Utc>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            calls: Mutex::new(Vec::new()),
            members: Mutex::new(BTreeSet::new()),
            can_manage: Mutex::new(true),
            fail_privilege_check: Mutex::new(false),
            fail_members: Mutex::new(false),
            fail_create: Mutex::new(false),
            fail_assign: Mutex::new(BTreeSet::new()),
            fail_send: Mutex::new(false),
            fail_delete: Mutex::new(false),
            fail_thread_edit: Mutex::new(BTreeSet::new()),
            active: Mutex::new(Vec::new()),
            archived: Mutex::new(Vec::new()),
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn with_members(ids: impl IntoIterator<Item = u64>) -> Self {
        let fake = Self::new();
        *fake.members.lock().unwrap() = ids.into_iter().map(UserId).collect();
        fake
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    pub fn sent_contents(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Send { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn thread_edits(&self) -> Vec<(ChannelId, ThreadEdit)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::EditThread(id, e) => Some((*id, e.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn add_thread(&self, thread: ForumThread) {
        if thread.archived {
            self.archived.lock().unwrap().insert(0, thread);
        } else {
            self.active.lock().unwrap().push(thread);
        }
    }
}

#[async_trait]
impl MemberDirectory for FakePlatform {
    async fn member_ids(&self, guild_id: GuildId) -> Result<BTreeSet<UserId>> {
        self.record(Call::MemberIds(guild_id));
        if *self.fail_members.lock().unwrap() {
            return Err(forbidden("members intent"));
        }
        Ok(self.members.lock().unwrap().clone())
    }
}

#[async_trait]
impl GroupingPort for FakePlatform {
    async fn can_manage_groups(&self, _guild_id: GuildId) -> Result<bool> {
        if *self.fail_privilege_check.lock().unwrap() {
            return Err(Error::External("guild lookup timed out".to_string()));
        }
        Ok(*self.can_manage.lock().unwrap())
    }

    async fn create_group(&self, guild_id: GuildId, spec: &GroupSpec) -> Result<GroupHandle> {
        self.record(Call::CreateGroup(spec.clone()));
        if *self.fail_create.lock().unwrap() {
            return Err(forbidden("manage roles"));
        }
        Ok(GroupHandle {
            guild_id,
            role_id: RoleId(self.next()),
            name: spec.name.clone(),
        })
    }

    async fn assign(&self, group: &GroupHandle, user_id: UserId) -> Result<()> {
        self.record(Call::Assign(group.role_id, user_id));
        if self.fail_assign.lock().unwrap().contains(&user_id) {
            return Err(forbidden("role hierarchy"));
        }
        Ok(())
    }

    async fn set_mentionable(&self, group: &GroupHandle, mentionable: bool) -> Result<()> {
        self.record(Call::SetMentionable(group.role_id, mentionable));
        Ok(())
    }

    async fn delete_group(&self, group: &GroupHandle) -> Result<()> {
        self.record(Call::DeleteGroup(group.role_id));
        if *self.fail_delete.lock().unwrap() {
            return Err(forbidden("manage roles"));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSurface for FakePlatform {
    async fn send(
        &self,
        channel_id: ChannelId,
        content: &str,
        mentions: MentionPolicy,
    ) -> Result<MessageRef> {
        self.record(Call::Send {
            channel_id,
            content: content.to_string(),
            mentions,
        });
        if *self.fail_send.lock().unwrap() {
            return Err(forbidden("send messages"));
        }
        Ok(MessageRef {
            channel_id,
            message_id: MessageId(self.next()),
        })
    }

    async fn edit(&self, msg: MessageRef, content: &str, mentions: MentionPolicy) -> Result<()> {
        self.record(Call::Edit {
            msg,
            content: content.to_string(),
            mentions,
        });
        Ok(())
    }
}

#[async_trait]
impl ForumPort for FakePlatform {
    async fn active_threads(
        &self,
        _guild_id: GuildId,
        forum_id: ChannelId,
    ) -> Result<Vec<ForumThread>> {
        Ok(self
            .active
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.parent_id == Some(forum_id))
            .cloned()
            .collect())
    }

    async fn archived_threads(&self, forum_id: ChannelId, limit: usize) -> Result<Vec<ForumThread>> {
        Ok(self
            .archived
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.parent_id == Some(forum_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_thread(&self, forum_id: ChannelId, post: &NewThread) -> Result<ForumThread> {
        self.record(Call::CreateThread(forum_id, post.clone()));
        let thread = ForumThread {
            id: ChannelId(self.next()),
            parent_id: Some(forum_id),
            name: post.name.clone(),
            applied_tags: post.applied_tags.clone(),
            archived: false,
            locked: false,
            pinned: false,
            created_at: *self.now.lock().unwrap(),
        };
        self.active.lock().unwrap().push(thread.clone());
        Ok(thread)
    }

    async fn edit_thread(&self, thread_id: ChannelId, edit: &ThreadEdit) -> Result<()> {
        self.record(Call::EditThread(thread_id, edit.clone()));
        if self.fail_thread_edit.lock().unwrap().contains(&thread_id) {
            return Err(forbidden("manage threads"));
        }

        let mut active = self.active.lock().unwrap();
        let mut archived = self.archived.lock().unwrap();
        let found = match active.iter().position(|t| t.id == thread_id) {
            Some(i) => Some(active.remove(i)),
            None => archived
                .iter()
                .position(|t| t.id == thread_id)
                .map(|i| archived.remove(i)),
        };
        let Some(mut t) = found else {
            return Err(Error::Platform {
                status: 404,
                message: "Unknown Channel".to_string(),
            });
        };
        if let Some(tags) = &edit.applied_tags {
            t.applied_tags = tags.clone();
        }
        if let Some(v) = edit.archived {
            t.archived = v;
        }
        if let Some(v) = edit.locked {
            t.locked = v;
        }
        if let Some(v) = edit.pinned {
            t.pinned = v;
        }
        if t.archived {
            archived.insert(0, t);
        } else {
            active.push(t);
        }
        Ok(())
    }
}

/// Status surface that records every update.
#[derive(Default)]
pub(crate) struct RecordingStatus {
    pub updates: Mutex<Vec<String>>,
}

impl RecordingStatus {
    pub fn updates(&self) -> Vec<String> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusSurface for RecordingStatus {
    async fn update(&self, content: &str) -> Result<()> {
        self.updates.lock().unwrap().push(content.to_string());
        Ok(())
    }
}
