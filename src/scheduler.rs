//! Trigger source: parses the configured schedule and runs one task on it.
//!
//! Accepted expressions:
//! - 5 fields `min hour dom month dow` (runs at second 0)
//! - 6 fields `sec min hour dom month dow`
//! - 7 fields with a trailing year, passed to the `cron` crate unchanged
//! - `@yearly` `@annually` `@monthly` `@weekly` `@daily` `@midnight` `@hourly`
//! - `@every <duration>` such as `90s`, `1h30m`, `500ms`
//!
//! In the 5 and 6 field forms day-of-week numbers follow the usual cron
//! convention (0 or 7 = Sunday, 6 = Saturday).

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

static EVERY_PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)(ms|s|m|h)").expect("valid regex"));

/// Upper bound when counting missed ticks after a long run.
const MAX_SKIPPED_COUNT: usize = 10_000;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("empty schedule expression")]
    Empty,
    #[error("unknown shortcut {0}")]
    UnknownShortcut(String),
    #[error("invalid @every duration {0:?}")]
    InvalidEvery(String),
    #[error("invalid day-of-week field {0:?}")]
    DayOfWeek(String),
    #[error("expected 5, 6 or 7 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid cron expression: {0}")]
    Cron(#[from] cron::error::Error),
}

#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(cron::Schedule),
    Every(Duration),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if let Some(rest) = expr.strip_prefix("@every") {
            return parse_every(rest.trim()).map(Schedule::Every);
        }
        if expr.starts_with('@') {
            let cron_expr = match expr {
                "@yearly" | "@annually" => "0 0 0 1 1 *",
                "@monthly" => "0 0 0 1 * *",
                "@weekly" => "0 0 0 * * 1",
                "@daily" | "@midnight" => "0 0 0 * * *",
                "@hourly" => "0 0 * * * *",
                other => return Err(ScheduleError::UnknownShortcut(other.to_string())),
            };
            return Ok(Schedule::Cron(cron::Schedule::from_str(cron_expr)?));
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], translate_dow(fields[4])?),
            6 => format!("{} {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], fields[4], translate_dow(fields[5])?),
            7 => expr.to_string(),
            n => return Err(ScheduleError::FieldCount(n)),
        };
        Ok(Schedule::Cron(cron::Schedule::from_str(&normalized)?))
    }

    /// First trigger strictly after `now`.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Schedule::Cron(s) => s.after(now).next(),
            Schedule::Every(d) => chrono::Duration::from_std(*d)
                .ok()
                .and_then(|d| now.clone().checked_add_signed(d)),
        }
    }

    /// Triggers in `(from, until]`, counted up to a fixed cap.
    fn count_between<Tz: TimeZone>(&self, from: &DateTime<Tz>, until: &DateTime<Tz>) -> usize {
        match self {
            Schedule::Cron(s) => s
                .after(from)
                .take_while(|t| t <= until)
                .take(MAX_SKIPPED_COUNT)
                .count(),
            Schedule::Every(_) => 0,
        }
    }
}

fn parse_every(spec: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidEvery(spec.to_string());
    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for cap in EVERY_PART.captures_iter(spec) {
        let whole = cap.get(0).ok_or_else(invalid)?;
        if whole.start() != consumed {
            return Err(invalid());
        }
        consumed = whole.end();
        let n: u64 = cap[1].parse().map_err(|_| invalid())?;
        total += match &cap[2] {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n * 60),
            _ => Duration::from_secs(n * 3600),
        };
    }
    if consumed != spec.len() || total.is_zero() {
        return Err(invalid());
    }
    Ok(total)
}

/// Map 0-7 (Sunday = 0 or 7) onto the `cron` crate's 1-7 (Sunday = 1).
/// A numeric range ending at 7 is expanded into a list, since Sunday moves to
/// the front. Names and `*` are left alone.
fn translate_dow(field: &str) -> Result<String, ScheduleError> {
    let invalid = || ScheduleError::DayOfWeek(field.to_string());
    let day = |v: &str| match v.parse::<u8>() {
        Ok(n) if n <= 7 => Ok(Some(n)),
        Ok(_) => Err(invalid()),
        Err(_) => Ok(None),
    };
    let shift = |n: u8| n % 7 + 1;

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (item, None),
        };
        let translated = match range.split_once('-') {
            Some((lo, hi)) => match (day(lo)?, day(hi)?) {
                (Some(lo), Some(7)) => {
                    let step = match step {
                        Some(s) => s.parse::<usize>().ok().filter(|s| *s > 0).ok_or_else(invalid)?,
                        None => 1,
                    };
                    let mut days: Vec<u8> = (lo..=7).step_by(step).map(shift).collect();
                    days.sort_unstable();
                    days.dedup();
                    let list = days.iter().map(u8::to_string).collect::<Vec<_>>().join(",");
                    items.push(list);
                    continue;
                }
                (Some(lo), Some(hi)) => format!("{}-{}", shift(lo), shift(hi)),
                _ => range.to_string(),
            },
            None => match day(range)? {
                Some(n) => shift(n).to_string(),
                None => range.to_string(),
            },
        };
        items.push(match step {
            Some(s) => format!("{translated}/{s}"),
            None => translated,
        });
    }
    Ok(items.join(","))
}

/// The unit of work a [`Scheduler`] triggers.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self);
}

/// Stops a running [`Scheduler`] once its current run, if any, returns.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Runs a single registered task on a schedule.
///
/// The task is awaited inline, so runs never overlap. A trigger that comes due
/// while a run is still in progress is skipped and logged.
pub struct Scheduler<T> {
    schedule: Schedule,
    task: T,
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl<T: ScheduledTask> Scheduler<T> {
    pub fn new(schedule: Schedule, task: T) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            schedule,
            task,
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { tx: self.tx.clone() }
    }

    /// Loop until stopped or the schedule has no further occurrences.
    pub async fn run(mut self) {
        loop {
            if *self.rx.borrow() {
                break;
            }
            let now = Local::now();
            let Some(next) = self.schedule.next_after(&now) else {
                warn!("schedule has no further occurrences");
                break;
            };
            info!(next = %next, "next run scheduled");
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = self.rx.changed() => {
                    if changed.is_err() || *self.rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.task.run().await;

            let skipped = self.schedule.count_between(&next, &Local::now());
            if skipped > 0 {
                warn!(skipped, "previous run overlapped scheduled triggers; skipped them");
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn six_field_daily() {
        let s = Schedule::parse("0 0 0 * * *").unwrap();
        assert_eq!(s.next_after(&at("2026-10-18T10:00:00Z")), Some(at("2026-10-19T00:00:00Z")));
    }

    #[test]
    fn five_field_gets_zero_seconds() {
        let s = Schedule::parse("30 8 * * *").unwrap();
        assert_eq!(s.next_after(&at("2026-10-18T10:00:00Z")), Some(at("2026-10-19T08:30:00Z")));
    }

    #[test]
    fn weekday_numbers_use_sunday_zero() {
        // 2026-10-18 is a Sunday
        let monday = Schedule::parse("0 9 * * 1").unwrap();
        assert_eq!(monday.next_after(&at("2026-10-18T10:00:00Z")), Some(at("2026-10-19T09:00:00Z")));
        let sunday = Schedule::parse("0 9 * * 0").unwrap();
        assert_eq!(sunday.next_after(&at("2026-10-18T10:00:00Z")), Some(at("2026-10-25T09:00:00Z")));
        assert_eq!(translate_dow("1-5").unwrap(), "2-6");
        assert_eq!(translate_dow("*/2").unwrap(), "*/2");
        assert_eq!(translate_dow("0,7,MON").unwrap(), "1,1,MON");
    }

    #[test]
    fn ranges_ending_on_sunday_seven() {
        assert_eq!(translate_dow("5-7").unwrap(), "1,6,7");
        assert_eq!(translate_dow("0-7").unwrap(), "1,2,3,4,5,6,7");
        assert_eq!(translate_dow("1-7/2").unwrap(), "1,2,4,6");

        // 2026-10-18 is a Sunday
        let every_day = Schedule::parse("0 9 * * 1-7").unwrap();
        assert_eq!(every_day.next_after(&at("2026-10-18T08:00:00Z")), Some(at("2026-10-18T09:00:00Z")));
        assert_eq!(every_day.next_after(&at("2026-10-18T10:00:00Z")), Some(at("2026-10-19T09:00:00Z")));

        let weekend = Schedule::parse("0 9 * * 5-7").unwrap();
        assert_eq!(weekend.next_after(&at("2026-10-18T08:00:00Z")), Some(at("2026-10-18T09:00:00Z")));
        assert_eq!(weekend.next_after(&at("2026-10-18T10:00:00Z")), Some(at("2026-10-23T09:00:00Z")));
    }

    #[test]
    fn weekday_above_seven_rejected() {
        assert!(matches!(Schedule::parse("0 9 * * 8"), Err(ScheduleError::DayOfWeek(_))));
        assert!(matches!(Schedule::parse("0 9 * * 1-9"), Err(ScheduleError::DayOfWeek(_))));
        assert!(matches!(Schedule::parse("0 0 9 * * 3,8"), Err(ScheduleError::DayOfWeek(_))));
    }

    #[test]
    fn shortcuts() {
        let daily = Schedule::parse("@daily").unwrap();
        assert_eq!(daily.next_after(&at("2026-10-18T10:00:00Z")), Some(at("2026-10-19T00:00:00Z")));
        let hourly = Schedule::parse("@hourly").unwrap();
        assert_eq!(hourly.next_after(&at("2026-10-18T10:15:00Z")), Some(at("2026-10-18T11:00:00Z")));
        assert!(matches!(Schedule::parse("@fortnightly"), Err(ScheduleError::UnknownShortcut(_))));
    }

    #[test]
    fn every_durations() {
        match Schedule::parse("@every 1h30m").unwrap() {
            Schedule::Every(d) => assert_eq!(d, Duration::from_secs(5400)),
            other => panic!("unexpected schedule {other:?}"),
        }
        let s = Schedule::parse("@every 500ms").unwrap();
        assert_eq!(
            s.next_after(&at("2026-10-18T10:00:00Z")),
            Some(at("2026-10-18T10:00:00.500Z"))
        );
        assert!(matches!(Schedule::parse("@every"), Err(ScheduleError::InvalidEvery(_))));
        assert!(matches!(Schedule::parse("@every 5 minutes"), Err(ScheduleError::InvalidEvery(_))));
        assert!(matches!(Schedule::parse("@every 0s"), Err(ScheduleError::InvalidEvery(_))));
    }

    #[test]
    fn malformed_expressions() {
        assert!(matches!(Schedule::parse("  "), Err(ScheduleError::Empty)));
        assert!(matches!(Schedule::parse("* * *"), Err(ScheduleError::FieldCount(3))));
        assert!(matches!(Schedule::parse("0 0 zz * * *"), Err(ScheduleError::Cron(_))));
    }

    #[test]
    fn counts_missed_triggers() {
        let s = Schedule::parse("@hourly").unwrap();
        assert_eq!(s.count_between(&at("2026-10-18T10:00:00Z"), &at("2026-10-18T13:30:00Z")), 3);
    }

    struct CountingTask {
        runs: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        stop_after: usize,
        handle: std::sync::Mutex<Option<SchedulerHandle>>,
    }

    #[async_trait]
    impl ScheduledTask for CountingTask {
        async fn run(&self) {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.runs.fetch_add(1, Ordering::SeqCst) + 1 >= self.stop_after {
                if let Some(h) = self.handle.lock().unwrap().as_ref() {
                    h.stop();
                }
            }
        }
    }

    #[tokio::test]
    async fn runs_sequentially_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let task = CountingTask {
            runs: runs.clone(),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: max_active.clone(),
            stop_after: 3,
            handle: std::sync::Mutex::new(None),
        };
        let scheduler = Scheduler::new(Schedule::parse("@every 10ms").unwrap(), task);
        *scheduler.task.handle.lock().unwrap() = Some(scheduler.handle());

        tokio::time::timeout(Duration::from_secs(10), scheduler.run())
            .await
            .expect("scheduler did not stop");
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_before_first_trigger() {
        let task = CountingTask {
            runs: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            stop_after: usize::MAX,
            handle: std::sync::Mutex::new(None),
        };
        let runs = task.runs.clone();
        let scheduler = Scheduler::new(Schedule::parse("@yearly").unwrap(), task);
        let handle = scheduler.handle();
        let join = tokio::spawn(scheduler.run());
        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), join)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
