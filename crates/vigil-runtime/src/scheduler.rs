//! # Natural-language scheduler
//!
//! Turns phrases like `"every weekday at 9:30 check the build"` into jobs and
//! fires them as `timer` events on the bus.
//!
//! Supported recurrences:
//! - **daily**: "every day", "daily", "each day", "every morning"
//! - **weekday**: "every weekday", "on weekdays", "weekdays"
//! - **weekly**: "every monday", "on mondays", "every week on monday"
//! - **once**: "today", "tomorrow", "on friday", or no recurrence at all
//!   (the next time the clock reads that time)
//! - **cron**: `cron "0 30 9 * * Mon-Fri" <action>` for anything else
//!
//! All times are wall-clock local times. The job table lives in `jobs.jsonl`
//! and is rewritten atomically on every change.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
    Weekday,
};
use cron::Schedule;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use vigil_core::{Event, EventBus, JobId, ReplyTarget, Result, VigilError, jsonl};

// ── Parsing ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleParseError {
    #[error("nothing to schedule")]
    Empty,
    #[error("no time of day given (try \"at 3pm\" or \"at 15:00\")")]
    MissingTime,
    #[error("'{0}' is ambiguous; say am/pm or use 24-hour time")]
    AmbiguousTime(String),
    #[error("'{0}' is not a valid time")]
    InvalidTime(String),
    #[error("unsupported recurrence '{0}' (use a cron expression instead)")]
    UnsupportedRecurrence(String),
    #[error("no action given")]
    MissingAction,
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

impl From<ScheduleParseError> for VigilError {
    fn from(e: ScheduleParseError) -> Self {
        VigilError::Schedule(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    Weekday,
    Weekly { day: Weekday },
    Once { date: NaiveDate },
    Cron { expression: String },
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recurrence::Daily => f.write_str("daily"),
            Recurrence::Weekday => f.write_str("weekdays"),
            Recurrence::Weekly { day } => write!(f, "weekly on {}", day_name(*day)),
            Recurrence::Once { date } => write!(f, "once on {date}"),
            Recurrence::Cron { expression } => write!(f, "cron `{expression}`"),
        }
    }
}

/// The structured meaning of a schedule phrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSchedule {
    pub recurrence: Recurrence,
    /// `None` only for cron recurrences, which carry their own times.
    pub time_of_day: Option<NaiveTime>,
    pub action: String,
}

impl ParsedSchedule {
    /// The first fire time strictly after `after`, or `None` when a one-shot
    /// has already passed.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        if let Recurrence::Cron { expression } = &self.recurrence {
            // Evaluated over the naive wall clock so DST never skips a fire.
            let schedule = Schedule::from_str(expression).ok()?;
            let anchor = Utc.from_utc_datetime(&after);
            return schedule.after(&anchor).next().map(|dt| dt.naive_utc());
        }

        let time = self.time_of_day?;
        let accepts = |date: NaiveDate| match &self.recurrence {
            Recurrence::Daily => true,
            Recurrence::Weekday => !matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
            Recurrence::Weekly { day } => date.weekday() == *day,
            Recurrence::Once { date: on } => date == *on,
            Recurrence::Cron { .. } => false,
        };

        if let Recurrence::Once { date } = &self.recurrence {
            let at = date.and_time(time);
            return (at > after).then_some(at);
        }

        (0..=7)
            .map(|offset| after.date() + ChronoDuration::days(offset))
            .filter(|date| accepts(*date))
            .map(|date| date.and_time(time))
            .find(|at| *at > after)
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self.recurrence, Recurrence::Once { .. })
    }
}

const DAYS: &str = "monday|tuesday|wednesday|thursday|friday|saturday|sunday";

static CRON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^\s*cron\s+"([^"]*)"\s*(.*)$"#).expect("static regex"));
static UNSUPPORTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(hourly|monthly|yearly|annually|fortnightly|every\s+(?:other\s+\w+|\d+\s+\w+|hours?|minutes?|months?|years?|fortnights?))\b",
    )
    .expect("static regex")
});
static WEEKDAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:every\s+weekday|on\s+weekdays|weekdays)\b").expect("static regex"));
static WEEKLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:every\s+week\s+on\s+({DAYS})s?|every\s+({DAYS})|on\s+({DAYS})s)\b"
    ))
    .expect("static regex")
});
static DAILY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:every\s+day|daily|each\s+day|every\s+(?:morning|afternoon|evening|night))\b")
        .expect("static regex")
});
static RELATIVE_DAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(today|tonight|tomorrow)\b").expect("static regex"));
static ON_DAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\bon\s+({DAYS})\b")).expect("static regex"));
static EVERY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bevery\b\s*\w*").expect("static regex"));

static AMPM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").expect("static regex")
});
static CLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:at\s+)?(\d{1,2}):(\d{2})\b").expect("static regex"));
static NAMED_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:at\s+)?(noon|midnight)\b").expect("static regex"));
static BARE_HOUR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bat\s+(\d{1,2})\b").expect("static regex"));

/// Parse relative to the local clock.
pub fn parse(text: &str) -> std::result::Result<ParsedSchedule, ScheduleParseError> {
    parse_at(text, Local::now().naive_local())
}

/// Parse with an explicit "now", which resolves one-shot dates.
pub fn parse_at(text: &str, now: NaiveDateTime) -> std::result::Result<ParsedSchedule, ScheduleParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ScheduleParseError::Empty);
    }

    if let Some(caps) = CRON_RE.captures(text) {
        let expression = caps[1].trim().to_string();
        Schedule::from_str(&expression).map_err(|e| ScheduleParseError::InvalidCron(e.to_string()))?;
        let action = clean_action(&caps[2]);
        if action.is_empty() {
            return Err(ScheduleParseError::MissingAction);
        }
        return Ok(ParsedSchedule {
            recurrence: Recurrence::Cron { expression },
            time_of_day: None,
            action,
        });
    }

    if let Some(m) = UNSUPPORTED_RE.find(text) {
        return Err(ScheduleParseError::UnsupportedRecurrence(m.as_str().to_lowercase()));
    }

    let mut spans: Vec<Range<usize>> = Vec::new();
    let (time, time_span) = parse_time(text)?;
    spans.push(time_span);

    let recurrence = if let Some(m) = WEEKDAY_RE.find(text) {
        spans.push(m.range());
        Recurrence::Weekday
    } else if let Some(caps) = WEEKLY_RE.captures(text) {
        spans.push(whole(&caps));
        let name = (1..=3).find_map(|i| caps.get(i)).map(|m| m.as_str()).unwrap_or_default();
        Recurrence::Weekly {
            day: weekday_from_name(name).ok_or_else(|| ScheduleParseError::UnsupportedRecurrence(name.to_string()))?,
        }
    } else if let Some(m) = DAILY_RE.find(text) {
        spans.push(m.range());
        Recurrence::Daily
    } else if let Some(m) = EVERY_RE.find(text) {
        return Err(ScheduleParseError::UnsupportedRecurrence(m.as_str().trim().to_lowercase()));
    } else if let Some(caps) = RELATIVE_DAY_RE.captures(text) {
        spans.push(whole(&caps));
        let date = match caps[1].to_lowercase().as_str() {
            "tomorrow" => now.date() + ChronoDuration::days(1),
            _ => now.date(),
        };
        Recurrence::Once { date }
    } else if let Some(caps) = ON_DAY_RE.captures(text) {
        spans.push(whole(&caps));
        let day = weekday_from_name(&caps[1]).ok_or_else(|| ScheduleParseError::UnsupportedRecurrence(caps[1].to_string()))?;
        let date = (0..=7)
            .map(|offset| now.date() + ChronoDuration::days(offset))
            .find(|d| d.weekday() == day && d.and_time(time) > now)
            .unwrap_or(now.date());
        Recurrence::Once { date }
    } else {
        let date = if now.date().and_time(time) > now {
            now.date()
        } else {
            now.date() + ChronoDuration::days(1)
        };
        Recurrence::Once { date }
    };

    let action = clean_action(&strip_spans(text, spans));
    if action.is_empty() {
        return Err(ScheduleParseError::MissingAction);
    }

    Ok(ParsedSchedule {
        recurrence,
        time_of_day: Some(time),
        action,
    })
}

fn whole(caps: &Captures<'_>) -> Range<usize> {
    caps.get(0).map(|m| m.range()).unwrap_or(0..0)
}

fn parse_time(text: &str) -> std::result::Result<(NaiveTime, Range<usize>), ScheduleParseError> {
    if let Some(caps) = AMPM_RE.captures(text) {
        let raw = caps[0].trim().to_string();
        let hour: u32 = caps[1].parse().map_err(|_| ScheduleParseError::InvalidTime(raw.clone()))?;
        let minute: u32 = match caps.get(2) {
            Some(m) => m.as_str().parse().map_err(|_| ScheduleParseError::InvalidTime(raw.clone()))?,
            None => 0,
        };
        if !(1..=12).contains(&hour) {
            return Err(ScheduleParseError::InvalidTime(raw));
        }
        let pm = caps[3].eq_ignore_ascii_case("pm");
        let hour24 = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, false) => h,
            (h, true) => h + 12,
        };
        let time = NaiveTime::from_hms_opt(hour24, minute, 0).ok_or(ScheduleParseError::InvalidTime(raw))?;
        return Ok((time, whole(&caps)));
    }

    if let Some(caps) = CLOCK_RE.captures(text) {
        let raw = caps[0].trim().to_string();
        let hour: u32 = caps[1].parse().map_err(|_| ScheduleParseError::InvalidTime(raw.clone()))?;
        let minute: u32 = caps[2].parse().map_err(|_| ScheduleParseError::InvalidTime(raw.clone()))?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or(ScheduleParseError::InvalidTime(raw))?;
        return Ok((time, whole(&caps)));
    }

    if let Some(caps) = NAMED_TIME_RE.captures(text) {
        let time = match caps[1].to_lowercase().as_str() {
            "noon" => NaiveTime::from_hms_opt(12, 0, 0),
            _ => NaiveTime::from_hms_opt(0, 0, 0),
        }
        .ok_or_else(|| ScheduleParseError::InvalidTime(caps[0].to_string()))?;
        return Ok((time, whole(&caps)));
    }

    if let Some(caps) = BARE_HOUR_RE.captures(text) {
        return Err(ScheduleParseError::AmbiguousTime(caps[0].trim().to_string()));
    }

    Err(ScheduleParseError::MissingTime)
}

fn strip_spans(text: &str, mut spans: Vec<Range<usize>>) -> String {
    spans.sort_by_key(|r| std::cmp::Reverse(r.start));
    let mut out = text.to_string();
    let mut floor = usize::MAX;
    for span in spans {
        // Overlapping matches were already removed with the later span.
        if span.end > floor || span.is_empty() {
            continue;
        }
        out.replace_range(span.clone(), " ");
        floor = span.start;
    }
    out
}

fn clean_action(raw: &str) -> String {
    const CONNECTORS: [&str; 5] = ["at", "on", "then", "and", "to"];
    let mut words: Vec<&str> = raw.split_whitespace().collect();
    let trim = |w: &str| w.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '-' | '.')).to_lowercase();
    while words.first().is_some_and(|w| trim(*w).is_empty() || CONNECTORS.contains(&trim(*w).as_str())) {
        words.remove(0);
    }
    while words.last().is_some_and(|w| trim(*w).is_empty() || CONNECTORS[..2].contains(&trim(*w).as_str())) {
        words.pop();
    }
    words
        .join(" ")
        .trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '-'))
        .trim()
        .to_string()
}

fn weekday_from_name(name: &str) -> Option<Weekday> {
    match name.to_lowercase().trim_end_matches('s') {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

// ── Jobs ───────────────────────────────────────────────────────

/// One row of `jobs.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    /// The phrase the operator typed.
    pub phrase: String,
    pub schedule: ParsedSchedule,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<NaiveDateTime>,
    pub next_run_at: Option<NaiveDateTime>,
    /// Where the fired action's reply goes.
    pub reply_to: Option<ReplyTarget>,
}

impl ScheduledJob {
    pub fn action(&self) -> &str {
        &self.schedule.action
    }

    /// First eight characters of the id, enough to address it in `unschedule`.
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }

    fn is_due(&self, now: NaiveDateTime) -> bool {
        self.next_run_at.is_some_and(|at| at <= now)
    }
}

/// Owns the job table and fires due jobs onto the bus.
pub struct Scheduler {
    path: PathBuf,
    jobs: TokioMutex<Vec<ScheduledJob>>,
    bus: EventBus,
}

impl Scheduler {
    /// Load the table at `path`. Jobs whose next run is unknown get one
    /// computed from the current clock.
    pub fn load(path: impl Into<PathBuf>, bus: EventBus) -> Result<Self> {
        let path = path.into();
        let now = Local::now().naive_local();
        let mut jobs: Vec<ScheduledJob> = jsonl::read_all(&path)?;
        for job in jobs.iter_mut().filter(|j| j.next_run_at.is_none()) {
            job.next_run_at = job.schedule.next_after(job.last_run_at.unwrap_or(now));
        }
        debug!(path = %path.display(), jobs = jobs.len(), "job table loaded");
        Ok(Self {
            path,
            jobs: TokioMutex::new(jobs),
            bus,
        })
    }

    pub async fn add(&self, phrase: &str, reply_to: Option<ReplyTarget>) -> Result<ScheduledJob> {
        self.add_at(phrase, reply_to, Local::now().naive_local()).await
    }

    /// Parse `phrase` relative to `now` and store a new job. The same phrase
    /// added twice yields two independent jobs.
    pub async fn add_at(&self, phrase: &str, reply_to: Option<ReplyTarget>, now: NaiveDateTime) -> Result<ScheduledJob> {
        let schedule = parse_at(phrase, now)?;
        let next_run_at = schedule
            .next_after(now)
            .ok_or_else(|| VigilError::Schedule("that time has already passed".into()))?;

        let job = ScheduledJob {
            id: Uuid::new_v4(),
            phrase: phrase.trim().to_string(),
            schedule,
            created_at: Utc::now(),
            last_run_at: None,
            next_run_at: Some(next_run_at),
            reply_to,
        };

        let mut jobs = self.jobs.lock().await;
        jobs.push(job.clone());
        if let Err(e) = jsonl::rewrite(&self.path, &jobs) {
            jobs.pop();
            return Err(e);
        }
        info!(job_id = %job.id, recurrence = %job.schedule.recurrence, next_run = %next_run_at, "scheduled job");
        Ok(job)
    }

    /// Remove by full id or unique id prefix.
    pub async fn remove(&self, id_or_prefix: &str) -> Result<ScheduledJob> {
        let needle = id_or_prefix.trim().to_lowercase();
        if needle.is_empty() {
            return Err(VigilError::Schedule("no job id given".into()));
        }
        let mut jobs = self.jobs.lock().await;
        let matches: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.id.to_string().starts_with(&needle))
            .map(|(i, _)| i)
            .collect();
        let index = match matches.as_slice() {
            [] => return Err(VigilError::Schedule(format!("no job matches '{needle}'"))),
            [i] => *i,
            _ => {
                return Err(VigilError::Schedule(format!(
                    "'{needle}' matches {} jobs; use more of the id",
                    matches.len()
                )));
            }
        };
        let job = jobs.remove(index);
        if let Err(e) = jsonl::rewrite(&self.path, &jobs) {
            jobs.insert(index, job);
            return Err(e);
        }
        info!(job_id = %job.id, "removed job");
        Ok(job)
    }

    pub async fn list(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Fire every job due at `now`.
    ///
    /// Due jobs are advanced past `now` and persisted while the table lock is
    /// held; their timer events are published only after it is released. A
    /// job that missed several fires while the daemon was down fires once.
    pub async fn tick(&self, now: NaiveDateTime) -> Vec<JobId> {
        let due: Vec<Event> = {
            let mut jobs = self.jobs.lock().await;
            let mut events = Vec::new();
            jobs.retain_mut(|job| {
                if !job.is_due(now) {
                    return true;
                }
                events.push(Event::timer(job.id, job.action(), job.reply_to.as_ref()));
                job.last_run_at = Some(now);
                job.next_run_at = if job.schedule.is_one_shot() {
                    None
                } else {
                    job.schedule.next_after(now)
                };
                job.next_run_at.is_some()
            });
            if !events.is_empty()
                && let Err(e) = jsonl::rewrite(&self.path, &jobs)
            {
                error!(path = %self.path.display(), error = %e, "failed to persist job table after firing");
            }
            events
        };

        let mut fired = Vec::with_capacity(due.len());
        for event in due {
            let job_id = event.payload_str("job_id").unwrap_or_default();
            info!(job_id, action = event.text().unwrap_or_default(), "job fired");
            if let Ok(id) = Uuid::parse_str(job_id) {
                fired.push(id);
            }
            self.bus.publish(event);
        }
        fired
    }
}
