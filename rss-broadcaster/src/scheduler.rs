use crate::rss_utils::time::{format_duration, parse_compact_duration};
use crate::types::{BroadcastError, Result, RunContext};
use chrono::{DateTime, Local, Utc};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument, Span};

/// Upper bound when counting fire times a long run skipped over.
const MAX_MISSED_COUNT: usize = 10_000;

/// When runs fire: a cron expression (5 fields, or 6/7 with seconds and
/// year) or `@every <duration>`. Cron fields are read in the host's local
/// time zone.
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(cron::Schedule),
    Every(Duration),
}

impl Trigger {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let invalid = |reason: String| BroadcastError::InvalidSchedule {
            expr: expr.to_string(),
            reason,
        };

        if let Some(rest) = expr.strip_prefix("@every") {
            return parse_compact_duration(rest)
                .map(Trigger::Every)
                .ok_or_else(|| invalid("expected a duration like 10m or 1h30m".to_string()));
        }

        // Classic five-field crontab lines get a leading seconds field.
        let normalized = if expr.split_whitespace().count() == 5 {
            format!("0 {}", expr)
        } else {
            expr.to_string()
        };

        cron::Schedule::from_str(&normalized)
            .map(Trigger::Cron)
            .map_err(|e| invalid(e.to_string()))
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(schedule) => schedule
                .after(&now.with_timezone(&Local))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            Trigger::Every(period) => chrono::Duration::from_std(*period).ok().map(|p| now + p),
        }
    }

    /// Fire times strictly after `from` and not later than `to`.
    pub fn missed_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        if to <= from {
            return 0;
        }
        match self {
            Trigger::Cron(schedule) => schedule
                .after(&from.with_timezone(&Local))
                .take_while(|t| t.with_timezone(&Utc) <= to)
                .take(MAX_MISSED_COUNT)
                .count(),
            Trigger::Every(period) => {
                let elapsed = (to - from).to_std().unwrap_or_default();
                let period = period.as_secs_f64().max(f64::EPSILON);
                ((elapsed.as_secs_f64() / period).floor() as usize).min(MAX_MISSED_COUNT)
            }
        }
    }
}

/// Runs a job once at start and then on every trigger fire time.
///
/// Runs never overlap: the next fire time is chosen after the current run
/// has finished, and fire times that passed during a run are skipped.
pub struct Scheduler {
    trigger: Trigger,
    run_timeout: Duration,
    span: Span,
}

impl Scheduler {
    pub fn new(trigger: Trigger, run_timeout: Duration) -> Self {
        Self {
            trigger,
            run_timeout,
            span: info_span!("scheduler"),
        }
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Drive `job` until `shutdown` flips to true or its sender goes away. A
    /// run still in flight at shutdown is dropped.
    pub async fn run<F, Fut>(&self, job: F, shutdown: watch::Receiver<bool>)
    where
        F: FnMut(RunContext) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.drive(job, shutdown).instrument(self.span.clone()).await
    }

    async fn drive<F, Fut>(&self, mut job: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(RunContext) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut planned: Option<DateTime<Utc>> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let ctx = RunContext::with_timeout(self.run_timeout);
            info!("Starting run {}", ctx.run_id);
            tokio::select! {
                _ = job(ctx) => {}
                _ = shutdown.changed() => {
                    warn!("Shutdown requested, abandoning run {}", ctx.run_id);
                    break;
                }
            }

            let now = Utc::now();
            if let Some(planned) = planned {
                let missed = self.trigger.missed_between(planned, now);
                if missed > 0 {
                    warn!("Run {} overran the schedule; skipping {} fire times", ctx.run_id, missed);
                }
            }

            let Some(next) = self.trigger.next_after(now) else {
                warn!("Schedule has no further fire times, stopping");
                break;
            };
            planned = Some(next);

            let wait = (next - now).to_std().unwrap_or_default();
            info!("Next run at {} (in {})", next, format_duration(next - now));

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Scheduler stopped");
    }
}
