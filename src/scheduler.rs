//! Periodic background jobs.

use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::{
    task::JoinSet,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ScheduleError {
    #[snafu(display("invalid schedule {expr:?}"))]
    Period {
        expr: String,
        source: humantime::DurationError,
    },
    #[snafu(display("invalid cron schedule {expr:?}"))]
    Cron {
        expr: String,
        source: cron::error::Error,
    },
    #[snafu(display("schedule {expr:?} has a zero period"))]
    ZeroPeriod { expr: String },
    #[snafu(display("cron schedule {expr:?} never fires"))]
    NeverFires { expr: String },
}

/// A job the [`Scheduler`] runs repeatedly.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the job once. `cancel` fires when the scheduler shuts down.
    async fn run(&self, cancel: CancellationToken);
}

/// When a [`PeriodicTask`] runs.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// A fixed period, counted from when the task was scheduled.
    Every(Duration),
    /// Wall clock times in UTC.
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// The first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(period) => chrono::TimeDelta::from_std(*period)
                .ok()
                .and_then(|period| after.checked_add_signed(period)),
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Parse a schedule expression.
///
/// Accepts a cron expression such as `0 */3 * * *` or a period such as `3h`. Cron
/// expressions have five fields, or six and seven when seconds and years are given.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    if fields >= 5 {
        let normalized = match fields {
            5 => format!("0 {trimmed}"),
            _ => trimmed.to_string(),
        };
        let schedule = cron::Schedule::from_str(&normalized).context(CronSnafu { expr })?;
        schedule
            .upcoming(Utc)
            .next()
            .context(NeverFiresSnafu { expr })?;
        return Ok(Schedule::Cron(Box::new(schedule)));
    }
    let period = humantime::parse_duration(trimmed).context(PeriodSnafu { expr })?;
    ensure!(!period.is_zero(), ZeroPeriodSnafu { expr });
    Ok(Schedule::Every(period))
}

/// Runs [`PeriodicTask`]s on a [`Schedule`] until shut down.
///
/// A task never overlaps with itself: a fire time that passes while the previous run
/// is still going is skipped.
#[derive(Debug, Default)]
pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` on the schedule described by `expr`.
    ///
    /// A period starts counting now. A cron schedule first fires at its next matching
    /// time.
    pub fn schedule(&self, expr: &str, task: Arc<dyn PeriodicTask>) -> Result<(), ScheduleError> {
        let schedule = parse_schedule(expr)?;
        let cancel = self.cancel.clone();
        let span = info_span!("scheduler", task = task.name());
        info!(task = task.name(), expr, "scheduled task");
        self.tasks
            .lock()
            .spawn(run_periodic(task, Ticks::new(schedule), cancel).instrument(span));
        Ok(())
    }

    /// Cancel all tasks and wait for running ones to return.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                warn!(?err, "scheduled task panicked");
            }
        }
    }
}

enum Ticks {
    Interval(Interval),
    Cron {
        schedule: Box<cron::Schedule>,
        last: Option<DateTime<Utc>>,
    },
}

impl Ticks {
    fn new(schedule: Schedule) -> Self {
        match schedule {
            Schedule::Every(period) => {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Self::Interval(interval)
            }
            Schedule::Cron(schedule) => Self::Cron {
                schedule,
                last: None,
            },
        }
    }

    /// Wait for the next fire time. Returns `false` if there is none.
    async fn tick(&mut self) -> bool {
        match self {
            Self::Interval(interval) => {
                interval.tick().await;
                true
            }
            Self::Cron { schedule, last } => {
                let now = Utc::now();
                // the timer may wake slightly before the wall clock reaches the fire time
                let from = last.map_or(now, |last| last.max(now));
                let Some(next) = schedule.after(&from).next() else {
                    return false;
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(%next, "next run");
                tokio::time::sleep(delay).await;
                *last = Some(next);
                true
            }
        }
    }
}

async fn run_periodic(task: Arc<dyn PeriodicTask>, mut ticks: Ticks, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fired = ticks.tick() => {
                if !fired {
                    warn!("schedule has no further fire times");
                    break;
                }
            }
        }
        debug!("running");
        task.run(cancel.child_token()).await;
    }
    debug!("stopped");
}
