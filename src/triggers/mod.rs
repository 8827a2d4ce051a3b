//! Triggers that decide when the pipeline runs
//!
//! Both strategies run iterations strictly one after another, so there is never
//! more than one run writing to a partition. They stop when the shutdown token is
//! cancelled (observed between runs and while waiting, never mid-run) or after
//! an optional number of runs.

use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::Pipeline;

/// Counts of finished runs, returned when a trigger stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStats {
    pub succeeded: u32,
    pub failed: u32,
}

impl TriggerStats {
    pub fn total(&self) -> u32 {
        self.succeeded + self.failed
    }

    fn record(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Something that invokes [`Pipeline::run_once`] on its own cadence
#[async_trait::async_trait]
pub trait Trigger: Send + Sync {
    /// Drive the pipeline until cancelled or out of runs
    async fn run(&self, pipeline: &Pipeline, shutdown: CancellationToken) -> TriggerStats;

    fn name(&self) -> &str;
}

/// Fires on wall-clock multiples of `interval` (every quarter hour by default)
///
/// The logical date is the UTC date of the interval that just closed, i.e. of
/// `tick - interval`, so the midnight run still lands in the previous day's
/// partition. Ticks missed while a run was
/// still going are skipped, not caught up. Retryable failures are re-run up to
/// `retries` times after `retry_delay`.
#[derive(Debug, Clone)]
pub struct FixedIntervalSchedule {
    interval: Duration,
    retries: u32,
    retry_delay: Duration,
    max_runs: Option<u32>,
}

impl FixedIntervalSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            retries: 0,
            retry_delay: Duration::from_secs(300),
            max_runs: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.schedule_interval).with_retries(settings.run_retries, settings.retry_delay)
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_runs(mut self, max_runs: Option<u32>) -> Self {
        self.max_runs = max_runs;
        self
    }

    /// First interval boundary (counted from the Unix epoch) strictly after `now`
    pub fn next_tick(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
        let step = (interval.as_millis() as i64).max(1);
        let next = (now.timestamp_millis().div_euclid(step) + 1) * step;

        DateTime::from_timestamp_millis(next)
            .unwrap_or_else(|| now + chrono::Duration::milliseconds(step))
    }

    /// UTC date of the interval ending at `tick`
    pub fn logical_date(tick: DateTime<Utc>, interval: Duration) -> NaiveDate {
        let step = (interval.as_millis() as i64).max(1);
        (tick - chrono::Duration::milliseconds(step)).date_naive()
    }

    /// One scheduled run plus its retries; true if it ended up succeeding
    async fn run_with_retries(
        &self,
        pipeline: &Pipeline,
        logical_date: NaiveDate,
        shutdown: &CancellationToken,
    ) -> bool {
        let mut attempt = 0;

        loop {
            let failure = match pipeline.run_once(logical_date).await {
                Ok(report) => {
                    info!(
                        "Scheduled run for {} stored {} in {}",
                        logical_date,
                        report.record.value,
                        report.csv_path.display()
                    );
                    return true;
                }
                Err(failure) => failure,
            };

            if attempt >= self.retries || !failure.error.is_retryable() {
                error!("{}", failure);
                return false;
            }

            attempt += 1;
            warn!(
                "{}; retrying in {:?} (attempt {}/{})",
                failure, self.retry_delay, attempt, self.retries
            );

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl Trigger for FixedIntervalSchedule {
    async fn run(&self, pipeline: &Pipeline, shutdown: CancellationToken) -> TriggerStats {
        let mut stats = TriggerStats::default();
        info!("Schedule started: every {:?}", self.interval);

        while self.max_runs.map_or(true, |max| stats.total() < max) {
            let now = Utc::now();
            let tick = Self::next_tick(now, self.interval);
            let wait = (tick - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let logical_date = Self::logical_date(tick, self.interval);
            let ok = self.run_with_retries(pipeline, logical_date, &shutdown).await;
            stats.record(ok);
        }

        info!(
            "Schedule stopped after {} runs ({} failed)",
            stats.total(),
            stats.failed
        );
        stats
    }

    fn name(&self) -> &str {
        "fixed_interval"
    }
}

/// Runs immediately, then again `delay` after each run finishes
///
/// The logical date is the current UTC date at the start of each iteration.
/// Failed runs are logged and the loop carries on.
#[derive(Debug, Clone)]
pub struct PollingLoop {
    delay: Duration,
    max_runs: Option<u32>,
}

impl PollingLoop {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_runs: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.poll_delay)
    }

    pub fn with_max_runs(mut self, max_runs: Option<u32>) -> Self {
        self.max_runs = max_runs;
        self
    }
}

#[async_trait::async_trait]
impl Trigger for PollingLoop {
    async fn run(&self, pipeline: &Pipeline, shutdown: CancellationToken) -> TriggerStats {
        let mut stats = TriggerStats::default();
        info!("Polling started: delay {:?}", self.delay);

        loop {
            if shutdown.is_cancelled() || self.max_runs.is_some_and(|max| stats.total() >= max) {
                break;
            }

            let logical_date = Utc::now().date_naive();
            match pipeline.run_once(logical_date).await {
                Ok(report) => {
                    info!("BTC price saved to {}", report.csv_path.display());
                    stats.record(true);
                }
                Err(failure) => {
                    error!("{}", failure);
                    stats.record(false);
                }
            }

            if self.max_runs.is_some_and(|max| stats.total() >= max) {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        info!(
            "Polling stopped after {} runs ({} failed)",
            stats.total(),
            stats.failed
        );
        stats
    }

    fn name(&self) -> &str {
        "polling_loop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PartitionLayout, PartitionResolver};
    use crate::types::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Fake source that tracks how many fetches overlap
    struct CountingSource {
        script: Mutex<Vec<Result<RawQuote>>>,
        fetches: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        latency: Duration,
    }

    impl CountingSource {
        fn new(mut script: Vec<Result<RawQuote>>, latency: Duration) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                fetches: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
                latency,
            })
        }

        fn healthy(latency: Duration) -> Arc<Self> {
            Self::new(Vec::new(), latency)
        }
    }

    #[async_trait::async_trait]
    impl PriceSource for CountingSource {
        async fn fetch(&self) -> Result<RawQuote> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.latency).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop();
            next.unwrap_or_else(|| Ok(RawQuote::new("65000.50", "BTC", "USD")))
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn pipeline(source: Arc<CountingSource>, root: &std::path::Path) -> Pipeline {
        Pipeline::new(source, PartitionResolver::new(root, PartitionLayout::KeyValue))
    }

    fn data_lines(root: &std::path::Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .map(|entry| {
                let content = std::fs::read_to_string(entry.unwrap().path().join("btc.csv")).unwrap();
                assert_eq!(
                    content.lines().filter(|l| l.starts_with("valor")).count(),
                    1,
                    "exactly one header per partition"
                );
                content.lines().count() - 1
            })
            .sum()
    }

    #[test]
    fn test_next_tick_aligns_to_interval() {
        let quarter = Duration::from_secs(900);

        let now = Utc.with_ymd_and_hms(2025, 9, 28, 12, 7, 31).unwrap();
        assert_eq!(
            FixedIntervalSchedule::next_tick(now, quarter),
            Utc.with_ymd_and_hms(2025, 9, 28, 12, 15, 0).unwrap()
        );

        let on_boundary = Utc.with_ymd_and_hms(2025, 9, 28, 12, 15, 0).unwrap();
        assert_eq!(
            FixedIntervalSchedule::next_tick(on_boundary, quarter),
            Utc.with_ymd_and_hms(2025, 9, 28, 12, 30, 0).unwrap()
        );

        let late = Utc.with_ymd_and_hms(2025, 9, 28, 23, 59, 0).unwrap();
        let tick = FixedIntervalSchedule::next_tick(late, quarter);
        assert_eq!(tick.date_naive(), NaiveDate::from_ymd_opt(2025, 9, 29).unwrap());
    }

    #[test]
    fn test_logical_date_is_start_of_closed_interval() {
        let quarter = Duration::from_secs(900);

        let midnight = Utc.with_ymd_and_hms(2025, 9, 29, 0, 0, 0).unwrap();
        assert_eq!(
            FixedIntervalSchedule::logical_date(midnight, quarter),
            NaiveDate::from_ymd_opt(2025, 9, 28).unwrap()
        );

        let quarter_past = Utc.with_ymd_and_hms(2025, 9, 29, 0, 15, 0).unwrap();
        assert_eq!(
            FixedIntervalSchedule::logical_date(quarter_past, quarter),
            NaiveDate::from_ymd_opt(2025, 9, 29).unwrap()
        );
    }

    #[tokio::test]
    async fn test_zero_max_runs_does_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let source = CountingSource::healthy(Duration::ZERO);
        let pipeline = pipeline(source.clone(), tmp.path());

        let polled = PollingLoop::new(Duration::from_millis(1))
            .with_max_runs(Some(0))
            .run(&pipeline, CancellationToken::new())
            .await;
        let scheduled = FixedIntervalSchedule::new(Duration::from_millis(10))
            .with_max_runs(Some(0))
            .run(&pipeline, CancellationToken::new())
            .await;

        assert_eq!(polled.total(), 0);
        assert_eq!(scheduled.total(), 0);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_polling_runs_never_overlap() {
        let tmp = tempfile::tempdir().unwrap();
        let source = CountingSource::healthy(Duration::from_millis(20));
        let pipeline = pipeline(source.clone(), tmp.path());

        let stats = PollingLoop::new(Duration::from_millis(1))
            .with_max_runs(Some(4))
            .run(&pipeline, CancellationToken::new())
            .await;

        assert_eq!(stats, TriggerStats { succeeded: 4, failed: 0 });
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(data_lines(tmp.path()), 4);
    }

    #[tokio::test]
    async fn test_polling_continues_after_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let source = CountingSource::new(
            vec![
                Err(EtlError::Upstream {
                    status_code: 503,
                    body: String::new(),
                }),
                Ok(RawQuote::new("0", "BTC", "USD")),
            ],
            Duration::ZERO,
        );
        let pipeline = pipeline(source.clone(), tmp.path());

        let stats = PollingLoop::new(Duration::from_millis(1))
            .with_max_runs(Some(3))
            .run(&pipeline, CancellationToken::new())
            .await;

        assert_eq!(stats, TriggerStats { succeeded: 1, failed: 2 });
        assert_eq!(data_lines(tmp.path()), 1);
    }

    #[tokio::test]
    async fn test_polling_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let pipeline = pipeline(CountingSource::healthy(Duration::ZERO), tmp.path());
        let shutdown = CancellationToken::new();

        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                shutdown.cancel();
            })
        };

        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            PollingLoop::new(Duration::from_secs(3600)).run(&pipeline, shutdown),
        )
        .await
        .expect("loop should stop once cancelled");
        canceller.await.unwrap();

        assert_eq!(stats.total(), 1);
    }

    #[tokio::test]
    async fn test_schedule_cancelled_before_first_tick() {
        let tmp = tempfile::tempdir().unwrap();
        let source = CountingSource::healthy(Duration::ZERO);
        let pipeline = pipeline(source.clone(), tmp.path());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = FixedIntervalSchedule::new(Duration::from_secs(3600))
            .run(&pipeline, shutdown)
            .await;

        assert_eq!(stats.total(), 0);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_schedule_runs_sequentially() {
        let tmp = tempfile::tempdir().unwrap();
        // Slower than the interval, so ticks get skipped rather than stacked
        let source = CountingSource::healthy(Duration::from_millis(80));
        let pipeline = pipeline(source.clone(), tmp.path());

        let stats = FixedIntervalSchedule::new(Duration::from_millis(30))
            .with_max_runs(Some(3))
            .run(&pipeline, CancellationToken::new())
            .await;

        assert_eq!(stats, TriggerStats { succeeded: 3, failed: 0 });
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(data_lines(tmp.path()), 3);
    }

    #[tokio::test]
    async fn test_schedule_retries_transient_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let source = CountingSource::new(
            vec![Err(EtlError::Unreachable("connection reset".to_string()))],
            Duration::ZERO,
        );
        let pipeline = pipeline(source.clone(), tmp.path());

        let stats = FixedIntervalSchedule::new(Duration::from_millis(20))
            .with_retries(1, Duration::from_millis(5))
            .with_max_runs(Some(1))
            .run(&pipeline, CancellationToken::new())
            .await;

        assert_eq!(stats, TriggerStats { succeeded: 1, failed: 0 });
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_schedule_does_not_retry_rejections() {
        let tmp = tempfile::tempdir().unwrap();
        let source = CountingSource::new(
            vec![Err(EtlError::Upstream {
                status_code: 503,
                body: "maintenance".to_string(),
            })],
            Duration::ZERO,
        );
        let pipeline = pipeline(source.clone(), tmp.path());

        let stats = FixedIntervalSchedule::new(Duration::from_millis(20))
            .with_retries(3, Duration::from_millis(5))
            .with_max_runs(Some(1))
            .run(&pipeline, CancellationToken::new())
            .await;

        assert_eq!(stats, TriggerStats { succeeded: 0, failed: 1 });
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }
}
