//! Cron-driven scheduling of update cycles.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use croner::Cron;
use log::{error, info, warn};
use tokio::time::sleep;

use crate::config::DEFAULT_SCHEDULE;

/// Longest single sleep, so shutdown requests are noticed promptly.
pub const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);
/// Pause after a failed cycle before scheduling resumes.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    cron: Cron,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, croner::errors::CronError> {
        let cron = Cron::new(expression).parse()?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    /// Parse `expression`, falling back to the daily default with a warning.
    pub fn parse_or_default(expression: &str) -> Self {
        match Self::parse(expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!("Invalid cron schedule '{}': {}", expression, e);
                warn!("Using default schedule: {}", DEFAULT_SCHEDULE);
                Self::default()
            }
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first scheduled instant strictly after `now`.
    pub fn next_after(&self, now: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.cron.find_next_occurrence(now, false).ok()
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            expression: DEFAULT_SCHEDULE.to_string(),
            cron: Cron::new(DEFAULT_SCHEDULE)
                .parse()
                .expect("default schedule is valid"),
        }
    }
}

impl FromStr for Schedule {
    type Err = croner::errors::CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Work run on every scheduled tick.
#[async_trait]
pub trait Cycle: Send {
    async fn run(&mut self) -> anyhow::Result<()>;
}

pub struct Scheduler {
    schedule: Schedule,
    run_on_startup: bool,
    running: Arc<AtomicBool>,
    slice: Duration,
    backoff: Duration,
}

impl Scheduler {
    pub fn new(schedule: Schedule, run_on_startup: bool, running: Arc<AtomicBool>) -> Self {
        Self {
            schedule,
            run_on_startup,
            running,
            slice: MAX_SLEEP_SLICE,
            backoff: ERROR_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep for `total` in slices, stopping early on shutdown.
    /// Returns whether we are still running.
    async fn sleep_while_running(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() && self.is_running() {
            let step = remaining.min(self.slice);
            sleep(step).await;
            remaining -= step;
        }
        self.is_running()
    }

    async fn run_once<C: Cycle + ?Sized>(&self, cycle: &mut C) {
        if let Err(e) = cycle.run().await {
            error!("Error in main loop: {:#}", e);
            self.sleep_while_running(self.backoff).await;
        }
    }

    /// Run cycles on schedule until the running flag is cleared.
    pub async fn run<C: Cycle + ?Sized>(&self, cycle: &mut C) {
        if self.run_on_startup && self.is_running() {
            info!("Running initial update cycle on startup...");
            self.run_once(cycle).await;
        }

        while self.is_running() {
            let now = Local::now();
            let Some(next) = self.schedule.next_after(&now) else {
                error!(
                    "Schedule '{}' has no upcoming occurrence",
                    self.schedule.expression()
                );
                self.sleep_while_running(self.backoff).await;
                continue;
            };

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                info!(
                    "Next update scheduled for: {}",
                    next.format("%Y-%m-%d %H:%M:%S")
                );
            }
            if !self.sleep_while_running(wait).await {
                break;
            }

            self.run_once(cycle).await;
        }

        info!("Docker Image Watch - Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use tokio::time::Instant;

    struct CountingCycle {
        calls: Vec<Instant>,
        in_progress: bool,
        stop_after: usize,
        fail_first: bool,
        running: Arc<AtomicBool>,
    }

    impl CountingCycle {
        fn new(stop_after: usize, running: Arc<AtomicBool>) -> Self {
            Self {
                calls: Vec::new(),
                in_progress: false,
                stop_after,
                fail_first: false,
                running,
            }
        }
    }

    #[async_trait]
    impl Cycle for CountingCycle {
        async fn run(&mut self) -> anyhow::Result<()> {
            assert!(!self.in_progress, "cycles overlapped");
            self.in_progress = true;
            self.calls.push(Instant::now());
            sleep(Duration::from_secs(5)).await;
            self.in_progress = false;

            if self.calls.len() >= self.stop_after {
                self.running.store(false, Ordering::SeqCst);
            }
            if self.fail_first && self.calls.len() == 1 {
                anyhow::bail!("runtime went away");
            }
            Ok(())
        }
    }

    fn running() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    /// Collects warnings from every test in this binary.
    struct WarnCapture;

    static WARNINGS: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());
    static CAPTURE: WarnCapture = WarnCapture;

    impl log::Log for WarnCapture {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                WARNINGS.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    fn capture_warnings() {
        if log::set_logger(&CAPTURE).is_ok() {
            log::set_max_level(log::LevelFilter::Warn);
        }
    }

    #[test]
    fn invalid_expression_falls_back_to_default() {
        capture_warnings();
        for bad in ["not a cron", "61 * * * *", ""] {
            let schedule = Schedule::parse_or_default(bad);
            assert_eq!(schedule.expression(), "0 4 * * *", "{bad:?}");
        }

        let warnings = WARNINGS.lock().unwrap();
        for bad in ["not a cron", "61 * * * *"] {
            let prefix = format!("Invalid cron schedule '{}'", bad);
            assert!(warnings.iter().any(|w| w.starts_with(&prefix)), "{bad:?}");
        }
        assert!(warnings
            .iter()
            .any(|w| w == "Using default schedule: 0 4 * * *"));
    }

    #[test]
    fn valid_expression_is_kept() {
        let schedule = Schedule::parse_or_default("*/15 * * * *");
        assert_eq!(schedule.expression(), "*/15 * * * *");
        assert!("0 4 * * *".parse::<Schedule>().is_ok());
    }

    #[test]
    fn next_after_is_strictly_later() {
        let schedule = Schedule::default();
        let before = Local.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap();
        let next = schedule.next_after(&before).unwrap();
        assert_eq!((next.hour(), next.minute()), (4, 0));
        assert_eq!(next.date_naive(), before.date_naive());

        let again = schedule.next_after(&next).unwrap();
        assert!(again > next);
        assert_eq!(again.hour(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_startup_then_on_schedule() {
        let flag = running();
        let schedule = Schedule::parse("* * * * *").unwrap();
        let scheduler = Scheduler::new(schedule, true, flag.clone());
        let mut cycle = CountingCycle::new(3, flag);

        let start = Instant::now();
        scheduler.run(&mut cycle).await;

        assert_eq!(cycle.calls.len(), 3);
        assert_eq!(cycle.calls[0], start);
        for pair in cycle.calls.windows(2) {
            // The next instant is only computed after the previous cycle returned.
            assert!(pair[1] >= pair[0] + Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_backs_off() {
        let flag = running();
        let schedule = Schedule::parse("* * * * *").unwrap();
        let scheduler =
            Scheduler::new(schedule, true, flag.clone()).with_backoff(Duration::from_secs(300));
        let mut cycle = CountingCycle::new(2, flag);
        cycle.fail_first = true;

        scheduler.run(&mut cycle).await;

        assert_eq!(cycle.calls.len(), 2);
        assert!(cycle.calls[1] >= cycle.calls[0] + Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_long_wait() {
        let flag = running();
        let schedule = Schedule::parse("0 0 1 1 *").unwrap();
        let scheduler = Scheduler::new(schedule, false, flag.clone());
        let mut cycle = CountingCycle::new(usize::MAX, flag.clone());

        let stopper = tokio::spawn(async move {
            sleep(Duration::from_secs(90)).await;
            flag.store(false, Ordering::SeqCst);
        });

        let start = Instant::now();
        scheduler.run(&mut cycle).await;
        stopper.await.unwrap();

        assert!(cycle.calls.is_empty());
        assert!(start.elapsed() <= Duration::from_secs(90) + MAX_SLEEP_SLICE);
    }
}
