//! Discord adapter (REST over reqwest).
//!
//! This crate implements the `newsbot-core` platform ports against the
//! Discord HTTP API. Gateway events are not consumed here.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::{sync::OnceCell, time::sleep};

mod wire;

use newsbot_core::{
    config::Config,
    domain::{ChannelId, GuildId, MessageRef, UserId},
    errors::Error,
    platform::{
        port::{ForumPort, GroupingPort, MemberDirectory, MessageSurface},
        types::{ForumThread, GroupHandle, GroupSpec, MentionPolicy, NewThread, ThreadEdit},
    },
    Result,
};

use wire::{
    allowed_mentions, can_manage_roles, WireGuild, WireMember, WireMessage, WireRateLimit,
    WireRole, WireThread, WireThreadList, WireUser, THREAD_FLAG_PINNED,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MEMBER_PAGE: usize = 1000;
const ARCHIVED_PAGE: usize = 100;
const MAX_THREAD_NAME: usize = 100;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    api_base: String,
    bot_user: Arc<OnceCell<UserId>>,
}

impl DiscordClient {
    pub fn new(token: &str, api_base: &str, proxy: Option<&str>) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bot {}", token.trim()))
            .map_err(|e| Error::Config(format!("invalid DISCORD_BOT_TOKEN: {e}")))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(
                "DiscordBot (https://github.com/newsbot, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .default_headers(headers);
        if let Some(url) = proxy {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| Error::Config(format!("invalid DISCORD_PROXY: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| Error::External(format!("discord client build error: {e}")))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_user: Arc::new(OnceCell::new()),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            &cfg.discord_bot_token,
            &cfg.discord_api_base,
            cfg.discord_proxy.as_deref(),
        )
    }

    /// Send one request; a 429 is retried once after the advertised wait.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        const MAX_RETRIES: usize = 1;
        let url = format!("{}{path}", self.api_base);
        let mut attempts = 0usize;
        loop {
            let mut req = self.http.request(method.clone(), &url);
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(b) = body {
                req = req.json(b);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Error::External(format!("discord request error: {e}")))?;

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            let header_wait = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = resp.text().await.unwrap_or_default();

            if status == StatusCode::TOO_MANY_REQUESTS && attempts < MAX_RETRIES {
                attempts += 1;
                let wait = retry_after(&text, header_wait.as_deref());
                tracing::warn!("[discord] rate limited on {method} {path}; retrying in {wait:?}");
                sleep(wait).await;
                continue;
            }
            return Err(platform_error(status.as_u16(), &text));
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T> {
        self.request(method, path, query, body)
            .await?
            .json()
            .await
            .map_err(|e| Error::External(format!("discord json error: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.call(Method::GET, path, query, None).await
    }

    async fn bot_user_id(&self) -> Result<UserId> {
        self.bot_user
            .get_or_try_init(|| async {
                let me: WireUser = self.get("/users/@me", &[]).await?;
                Ok::<_, Error>(me.id)
            })
            .await
            .copied()
    }
}

/// How long to wait before retrying a 429: JSON body first, then the header.
fn retry_after(body: &str, header: Option<&str>) -> Duration {
    let secs = serde_json::from_str::<WireRateLimit>(body)
        .ok()
        .map(|r| r.retry_after)
        .or_else(|| header.and_then(|h| h.trim().parse::<f64>().ok()))
        .filter(|s| s.is_finite() && *s >= 0.0)
        .unwrap_or(1.0);
    Duration::from_secs_f64(secs).min(MAX_RETRY_AFTER)
}

fn platform_error(status: u16, body: &str) -> Error {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    Error::Platform { status, message }
}

#[async_trait]
impl MemberDirectory for DiscordClient {
    async fn member_ids(&self, guild_id: GuildId) -> Result<BTreeSet<UserId>> {
        let path = format!("/guilds/{guild_id}/members");
        let mut out = BTreeSet::new();
        let mut after = UserId(0);
        loop {
            let page: Vec<WireMember> = self
                .get(
                    &path,
                    &[("limit", MEMBER_PAGE.to_string()), ("after", after.to_string())],
                )
                .await?;
            let full = page.len() >= MEMBER_PAGE;
            let before = after;
            for user in page.into_iter().filter_map(|m| m.user) {
                after = after.max(user.id);
                out.insert(user.id);
            }
            if !full || after == before {
                break;
            }
        }
        tracing::debug!("[discord] guild {guild_id}: {} members", out.len());
        Ok(out)
    }
}

#[async_trait]
impl GroupingPort for DiscordClient {
    async fn can_manage_groups(&self, guild_id: GuildId) -> Result<bool> {
        let bot_id = self.bot_user_id().await?;
        let guild: WireGuild = self.get(&format!("/guilds/{guild_id}"), &[]).await?;
        let member: WireMember = self
            .get(&format!("/guilds/{guild_id}/members/{bot_id}"), &[])
            .await?;
        Ok(can_manage_roles(&guild, bot_id, &member))
    }

    async fn create_group(&self, guild_id: GuildId, spec: &GroupSpec) -> Result<GroupHandle> {
        let body = json!({
            "name": spec.name,
            "permissions": "0",
            "mentionable": spec.mentionable,
            "hoist": false,
        });
        let role: WireRole = self
            .call(Method::POST, &format!("/guilds/{guild_id}/roles"), &[], Some(&body))
            .await?;
        Ok(GroupHandle {
            guild_id,
            role_id: role.id,
            name: role.name,
        })
    }

    async fn assign(&self, group: &GroupHandle, user_id: UserId) -> Result<()> {
        let path = format!(
            "/guilds/{}/members/{user_id}/roles/{}",
            group.guild_id, group.role_id
        );
        self.request(Method::PUT, &path, &[], None).await.map(|_| ())
    }

    async fn set_mentionable(&self, group: &GroupHandle, mentionable: bool) -> Result<()> {
        let path = format!("/guilds/{}/roles/{}", group.guild_id, group.role_id);
        let body = json!({ "mentionable": mentionable });
        self.request(Method::PATCH, &path, &[], Some(&body))
            .await
            .map(|_| ())
    }

    async fn delete_group(&self, group: &GroupHandle) -> Result<()> {
        let path = format!("/guilds/{}/roles/{}", group.guild_id, group.role_id);
        self.request(Method::DELETE, &path, &[], None).await.map(|_| ())
    }
}

#[async_trait]
impl MessageSurface for DiscordClient {
    async fn send(
        &self,
        channel_id: ChannelId,
        content: &str,
        mentions: MentionPolicy,
    ) -> Result<MessageRef> {
        let body = json!({
            "content": content,
            "allowed_mentions": allowed_mentions(&mentions),
        });
        let msg: WireMessage = self
            .call(
                Method::POST,
                &format!("/channels/{channel_id}/messages"),
                &[],
                Some(&body),
            )
            .await?;
        Ok(MessageRef {
            channel_id: msg.channel_id,
            message_id: msg.id,
        })
    }

    async fn edit(&self, msg: MessageRef, content: &str, mentions: MentionPolicy) -> Result<()> {
        let body = json!({
            "content": content,
            "allowed_mentions": allowed_mentions(&mentions),
        });
        let path = format!("/channels/{}/messages/{}", msg.channel_id, msg.message_id);
        self.request(Method::PATCH, &path, &[], Some(&body))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ForumPort for DiscordClient {
    async fn active_threads(
        &self,
        guild_id: GuildId,
        forum_id: ChannelId,
    ) -> Result<Vec<ForumThread>> {
        let list: WireThreadList = self
            .get(&format!("/guilds/{guild_id}/threads/active"), &[])
            .await?;
        Ok(list
            .threads
            .into_iter()
            .filter(|t| t.parent_id == Some(forum_id))
            .map(WireThread::into_thread)
            .collect())
    }

    async fn archived_threads(
        &self,
        forum_id: ChannelId,
        limit: usize,
    ) -> Result<Vec<ForumThread>> {
        let path = format!("/channels/{forum_id}/threads/archived/public");
        let mut out = Vec::new();
        let mut before: Option<String> = None;
        while out.len() < limit {
            let page_size = (limit - out.len()).min(ARCHIVED_PAGE);
            let mut query = vec![("limit", page_size.to_string())];
            if let Some(b) = &before {
                query.push(("before", b.clone()));
            }
            let page: WireThreadList = self.get(&path, &query).await?;
            let next = page
                .threads
                .last()
                .and_then(|t| t.archive_timestamp().map(str::to_string));
            let has_more = page.has_more;
            out.extend(page.threads.into_iter().map(WireThread::into_thread));
            match next {
                Some(ts) if has_more => before = Some(ts),
                _ => break,
            }
        }
        out.truncate(limit);
        Ok(out)
    }

    async fn create_thread(&self, forum_id: ChannelId, post: &NewThread) -> Result<ForumThread> {
        let name: String = post.name.chars().take(MAX_THREAD_NAME).collect();
        let body = json!({
            "name": name,
            "applied_tags": post.applied_tags,
            "message": {
                "content": post.content,
                "allowed_mentions": allowed_mentions(&MentionPolicy::None),
            },
        });
        let thread: WireThread = self
            .call(
                Method::POST,
                &format!("/channels/{forum_id}/threads"),
                &[],
                Some(&body),
            )
            .await?;
        Ok(thread.into_thread())
    }

    async fn edit_thread(&self, thread_id: ChannelId, edit: &ThreadEdit) -> Result<()> {
        let body = thread_edit_body(edit);
        if body.is_empty() {
            return Ok(());
        }
        self.request(
            Method::PATCH,
            &format!("/channels/{thread_id}"),
            &[],
            Some(&Value::Object(body)),
        )
        .await
        .map(|_| ())
    }
}

/// PATCH body for a thread edit; only the fields that change are sent.
fn thread_edit_body(edit: &ThreadEdit) -> Map<String, Value> {
    let mut body = Map::new();
    if let Some(tags) = &edit.applied_tags {
        body.insert("applied_tags".to_string(), json!(tags));
    }
    if let Some(archived) = edit.archived {
        body.insert("archived".to_string(), json!(archived));
    }
    if let Some(locked) = edit.locked {
        body.insert("locked".to_string(), json!(locked));
    }
    if let Some(pinned) = edit.pinned {
        let flags = if pinned { THREAD_FLAG_PINNED } else { 0 };
        body.insert("flags".to_string(), json!(flags));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsbot_core::domain::TagId;

    #[test]
    fn retry_after_prefers_body_then_header() {
        assert_eq!(
            retry_after(r#"{"message":"You are being rate limited.","retry_after":0.5,"global":false}"#, Some("3")),
            Duration::from_millis(500)
        );
        assert_eq!(retry_after("", Some("2")), Duration::from_secs(2));
        assert_eq!(retry_after("not json", None), Duration::from_secs(1));
        assert_eq!(retry_after(r#"{"retry_after":9999}"#, None), MAX_RETRY_AFTER);
    }

    #[test]
    fn platform_error_keeps_status_and_message() {
        let e = platform_error(403, r#"{"message":"Missing Permissions","code":50013}"#);
        assert!(e.is_forbidden());
        assert_eq!(e.to_string(), "platform error (403): Missing Permissions");

        let long = "x".repeat(500);
        match platform_error(502, &long) {
            Error::Platform { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message.len(), 200);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn thread_edit_body_only_sends_changes() {
        assert!(thread_edit_body(&ThreadEdit::default()).is_empty());

        let body = thread_edit_body(&ThreadEdit::close());
        assert_eq!(Value::Object(body), json!({ "archived": true, "locked": true }));

        let body = thread_edit_body(&ThreadEdit {
            applied_tags: Some(vec![TagId(3)]),
            pinned: Some(true),
            ..Default::default()
        });
        assert_eq!(
            Value::Object(body),
            json!({ "applied_tags": ["3"], "flags": 2 })
        );
    }

    #[test]
    fn client_trims_api_base() {
        let c = DiscordClient::new("t", "https://discord.com/api/v10/", None).unwrap();
        assert_eq!(c.api_base, "https://discord.com/api/v10");
    }
}
