//! Daily forum housekeeping: rotate the daily briefing post and archive stale
//! threads, once per local midnight.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, OnceLock},
    time::Duration,
};

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChannelId, GuildId, MessageRef, TagId},
    platform::{
        port::Platform,
        types::{ForumThread, MentionPolicy, NewThread, ThreadEdit},
    },
    Result,
};

/// How far back to look through archived threads for today's briefing.
const ARCHIVED_SCAN_LIMIT: usize = 200;

/// Per-guild forum settings, read from the forum config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumSettings {
    pub forum_channel_id: ChannelId,
    pub briefing_tag_id: TagId,
    pub past_briefing_tag_id: TagId,
    pub long_term_tag_id: TagId,
    /// Local time zone as a fixed offset from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Starter message of a new briefing; `{date}` is replaced.
    #[serde(default)]
    pub briefing_template: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

fn fixed_offset(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or(Utc.fix())
}

pub fn briefing_title(date: NaiveDate) -> String {
    format!("🗞️ | Daily Briefing - {}", date.format("%Y-%m-%d"))
}

fn briefing_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"🗞️.*?Daily Briefing.*?-\s*(\d{4})-(\d{1,2})-(\d{1,2})").ok())
        .as_ref()
}

/// Date a briefing title is for, if it is one.
pub fn briefing_date(title: &str) -> Option<NaiveDate> {
    let caps = briefing_regex()?.captures(title)?;
    let y = caps.get(1)?.as_str().parse().ok()?;
    let m = caps.get(2)?.as_str().parse().ok()?;
    let d = caps.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(y, m, d)
}

pub fn is_briefing_for(title: &str, date: NaiveDate) -> bool {
    briefing_date(title) == Some(date)
}

/// Calendar date at `now` in the given offset.
pub fn local_today(now: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    now.with_timezone(&fixed_offset(utc_offset_minutes)).date_naive()
}

/// Start of `date` in the given offset, as UTC.
pub fn local_midnight(date: NaiveDate, utc_offset_minutes: i32) -> DateTime<Utc> {
    let tz = fixed_offset(utc_offset_minutes);
    let naive = date.and_time(chrono::NaiveTime::MIN);
    match tz.from_local_datetime(&naive).single() {
        Some(dt) => dt.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

/// First local midnight strictly after `now`.
pub fn next_midnight(now: DateTime<Utc>, utc_offset_minutes: i32) -> DateTime<Utc> {
    let today = local_today(now, utc_offset_minutes);
    match today.succ_opt() {
        Some(tomorrow) => local_midnight(tomorrow, utc_offset_minutes),
        None => now + chrono::Duration::days(1),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HousekeepingSummary {
    pub archived_briefings: usize,
    /// Today's briefing, if it was found or created.
    pub briefing: Option<ChannelId>,
    pub created_briefing: bool,
    pub archived_stale: usize,
    /// One line per failed step or thread.
    pub errors: Vec<String>,
}

pub struct ForumHousekeeper {
    platform: Arc<dyn Platform>,
    /// Pause after every thread edit.
    edit_pause: Duration,
}

impl ForumHousekeeper {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            edit_pause: Duration::from_secs(1),
        }
    }

    pub fn with_edit_pause(mut self, pause: Duration) -> Self {
        self.edit_pause = pause;
        self
    }

    pub async fn run_daily(
        &self,
        guild_id: GuildId,
        settings: &ForumSettings,
        today: NaiveDate,
    ) -> HousekeepingSummary {
        let mut summary = HousekeepingSummary::default();
        let forum = settings.forum_channel_id;
        tracing::info!("[forum] guild {guild_id}: daily housekeeping for {today}");

        match self.platform.active_threads(guild_id, forum).await {
            Ok(threads) => self.archive_old_briefings(settings, today, &threads, &mut summary).await,
            Err(e) => fail(&mut summary, format!("listing threads for briefing rotation: {e}")),
        }

        if let Err(e) = self.ensure_today_briefing(guild_id, settings, today, &mut summary).await {
            fail(&mut summary, format!("publishing today's briefing: {e}"));
        }

        match self.platform.active_threads(guild_id, forum).await {
            Ok(threads) => self.archive_stale(settings, today, &threads, &mut summary).await,
            Err(e) => fail(&mut summary, format!("listing threads for archival: {e}")),
        }

        tracing::info!(
            "[forum] guild {guild_id}: done (briefings archived={}, stale archived={}, errors={})",
            summary.archived_briefings,
            summary.archived_stale,
            summary.errors.len()
        );
        summary
    }

    async fn archive_old_briefings(
        &self,
        settings: &ForumSettings,
        today: NaiveDate,
        threads: &[ForumThread],
        summary: &mut HousekeepingSummary,
    ) {
        let old = threads.iter().filter(|t| {
            t.has_tag(settings.briefing_tag_id) && !t.archived && !is_briefing_for(&t.name, today)
        });
        for thread in old {
            let mut tags: Vec<TagId> = thread
                .applied_tags
                .iter()
                .copied()
                .filter(|t| *t != settings.briefing_tag_id)
                .collect();
            if !tags.contains(&settings.past_briefing_tag_id) {
                tags.push(settings.past_briefing_tag_id);
            }
            let edit = ThreadEdit {
                applied_tags: Some(tags),
                pinned: Some(false),
                ..ThreadEdit::close()
            };
            match self.platform.edit_thread(thread.id, &edit).await {
                Ok(()) => {
                    tracing::info!("[forum] archived old briefing `{}`", thread.name);
                    summary.archived_briefings += 1;
                }
                Err(e) => fail(summary, format!("archiving briefing `{}`: {e}", thread.name)),
            }
            sleep(self.edit_pause).await;
        }
    }

    /// Today's briefing thread, searching active threads then recent archived ones.
    pub async fn find_briefing(
        &self,
        guild_id: GuildId,
        settings: &ForumSettings,
        date: NaiveDate,
    ) -> Result<Option<ForumThread>> {
        let forum = settings.forum_channel_id;
        let active = self.platform.active_threads(guild_id, forum).await?;
        if let Some(t) = active.into_iter().find(|t| is_briefing_for(&t.name, date)) {
            return Ok(Some(t));
        }
        match self.platform.archived_threads(forum, ARCHIVED_SCAN_LIMIT).await {
            Ok(archived) => Ok(archived.into_iter().find(|t| is_briefing_for(&t.name, date))),
            Err(e) if e.is_forbidden() => {
                tracing::warn!("[forum] cannot search archived threads of {forum}: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_today_briefing(
        &self,
        guild_id: GuildId,
        settings: &ForumSettings,
        today: NaiveDate,
        summary: &mut HousekeepingSummary,
    ) -> Result<()> {
        let pin = ThreadEdit {
            pinned: Some(true),
            locked: Some(true),
            ..Default::default()
        };

        if let Some(existing) = self.find_briefing(guild_id, settings, today).await? {
            let edit = ThreadEdit {
                archived: existing.archived.then_some(false),
                ..pin
            };
            self.platform.edit_thread(existing.id, &edit).await?;
            tracing::info!("[forum] pinned existing briefing `{}`", existing.name);
            summary.briefing = Some(existing.id);
            return Ok(());
        }

        let post = NewThread {
            name: briefing_title(today),
            content: briefing_body(settings, today),
            applied_tags: vec![settings.briefing_tag_id],
        };
        let created = self
            .platform
            .create_thread(settings.forum_channel_id, &post)
            .await?;
        summary.briefing = Some(created.id);
        summary.created_briefing = true;
        self.platform.edit_thread(created.id, &pin).await?;
        tracing::info!("[forum] created and pinned `{}`", created.name);
        Ok(())
    }

    async fn archive_stale(
        &self,
        settings: &ForumSettings,
        today: NaiveDate,
        threads: &[ForumThread],
        summary: &mut HousekeepingSummary,
    ) {
        let cutoff = local_midnight(today, settings.utc_offset_minutes);
        let briefing = summary.briefing;
        let stale = threads.iter().filter(|t| {
            t.created_at < cutoff
                && !t.locked
                && !t.archived
                && !t.has_tag(settings.long_term_tag_id)
                && Some(t.id) != briefing
        });
        for thread in stale {
            match self.platform.edit_thread(thread.id, &ThreadEdit::close()).await {
                Ok(()) => {
                    tracing::info!("[forum] archived stale thread `{}`", thread.name);
                    summary.archived_stale += 1;
                }
                Err(e) => fail(summary, format!("archiving `{}`: {e}", thread.name)),
            }
            sleep(self.edit_pause).await;
        }
    }

    /// Link `thread` from today's briefing. Returns `None` when there is no
    /// briefing for today.
    pub async fn announce_in_briefing(
        &self,
        guild_id: GuildId,
        settings: &ForumSettings,
        today: NaiveDate,
        thread: &ForumThread,
    ) -> Result<Option<MessageRef>> {
        let Some(briefing) = self.find_briefing(guild_id, settings, today).await? else {
            return Ok(None);
        };
        let long_term = thread.has_tag(settings.long_term_tag_id);
        let content = if long_term {
            format!("🔄 **Update**: {}\n{}", thread.name, thread.url(guild_id))
        } else {
            format!("📰 {}\n{}", thread.name, thread.url(guild_id))
        };
        let msg = self
            .platform
            .send(briefing.id, &content, MentionPolicy::None)
            .await?;
        Ok(Some(msg))
    }
}

fn briefing_body(settings: &ForumSettings, today: NaiveDate) -> String {
    let date = today.format("%Y-%m-%d").to_string();
    match &settings.briefing_template {
        Some(t) if !t.trim().is_empty() => t.replace("{date}", &date),
        _ => format!("## Daily briefing for {date}\nToday's news will be linked below as it is published."),
    }
}

fn fail(summary: &mut HousekeepingSummary, msg: String) {
    tracing::error!("[forum] {msg}");
    summary.errors.push(msg);
}

struct JobEntry {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    housekeeper: ForumHousekeeper,
    settings: BTreeMap<GuildId, ForumSettings>,
    jobs: Mutex<HashMap<GuildId, JobEntry>>,
}

/// Runs housekeeping for every enabled guild at its local midnight.
#[derive(Clone)]
pub struct HousekeepingScheduler {
    inner: Arc<SchedulerInner>,
}

impl HousekeepingScheduler {
    pub fn new(housekeeper: ForumHousekeeper, settings: BTreeMap<GuildId, ForumSettings>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                housekeeper,
                settings,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start one loop per enabled guild. Returns how many were started.
    pub async fn start(&self) -> usize {
        self.stop().await;

        let mut jobs = self.inner.jobs.lock().await;
        for (guild_id, settings) in &self.inner.settings {
            if !settings.enabled {
                tracing::info!("[forum] housekeeping disabled for guild {guild_id}");
                continue;
            }
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            let scheduler = self.clone();
            let guild_id = *guild_id;
            let handle = tokio::spawn(async move {
                scheduler.job_loop(guild_id, token).await;
            });
            jobs.insert(guild_id, JobEntry { cancel, handle });
        }

        if jobs.is_empty() {
            tracing::info!("[forum] no housekeeping jobs configured");
        } else {
            tracing::info!("[forum] started {} housekeeping jobs", jobs.len());
        }
        jobs.len()
    }

    pub async fn stop(&self) {
        let mut jobs = self.inner.jobs.lock().await;
        for (_, job) in jobs.drain() {
            job.cancel.cancel();
            job.handle.abort();
        }
    }

    /// Run the pass for `guild_id` now. `None` if the guild has no forum settings.
    pub async fn run_now(&self, guild_id: GuildId) -> Option<HousekeepingSummary> {
        let settings = self.inner.settings.get(&guild_id)?;
        let today = local_today(Utc::now(), settings.utc_offset_minutes);
        Some(self.inner.housekeeper.run_daily(guild_id, settings, today).await)
    }

    async fn job_loop(&self, guild_id: GuildId, cancel: CancellationToken) {
        let Some(settings) = self.inner.settings.get(&guild_id) else {
            return;
        };
        let offset = settings.utc_offset_minutes;
        let mut not_before = Utc::now();

        loop {
            let now = Utc::now().max(not_before);
            let next = next_midnight(now, offset);
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!("[forum] guild {guild_id}: next run at {next}");

            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = sleep(wait) => {
                let today = local_today(next, offset);
                self.inner.housekeeper.run_daily(guild_id, settings, today).await;
                not_before = next + chrono::Duration::seconds(1);
              }
            }
        }
    }
}
