// Recommendation Scheduler - Periodic AI analysis per symbol
// Short-term and long-term jobs, at most one run per job at a time

use chrono::Utc;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::core::config::SchedulerConfig;
use crate::core::types::Recommendation;
use crate::layer1::ai_client::{AiAnalysis, AnalysisError};
use crate::layer2::storage::{Storage, StorageError};
use crate::layer3::analysis::AnalysisResponse;

pub const SHORT_TERM_JOB: &str = "short_term";
pub const LONG_TERM_JOB: &str = "long_term";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("Unknown job: {0}")]
    UnknownJob(String),
    #[error("Scheduler already started")]
    AlreadyStarted,
}

// ============================================================================
// Jobs
// ============================================================================

/// A recurring job: every `interval`, analyze each symbol over the trailing
/// `lookback` of stored market data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub id: &'static str,
    pub interval: Duration,
    pub lookback: Duration,
}

impl JobSpec {
    pub fn every_minutes(id: &'static str, minutes: u64) -> Self {
        let period = Duration::from_secs(minutes.max(1).saturating_mul(60));
        Self {
            id,
            interval: period,
            lookback: period,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Vec<JobSpec> {
        vec![
            Self::every_minutes(SHORT_TERM_JOB, config.short_term_minutes),
            Self::every_minutes(LONG_TERM_JOB, config.long_term_minutes),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed { succeeded: usize, failed: usize },
    Skipped,
}

struct JobState {
    spec: JobSpec,
    running: AtomicBool,
}

/// Clears the job's running flag when the run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub is_running: bool,
    pub runs_started: u64,
    pub runs_skipped: u64,
    pub recommendations_saved: u64,
    pub symbol_failures: u64,
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SchedulerStats(running={}, runs={}, skipped={}, saved={}, failures={})",
            self.is_running, self.runs_started, self.runs_skipped, self.recommendations_saved, self.symbol_failures
        )
    }
}

pub struct RecommendationScheduler {
    storage: Arc<dyn Storage>,
    ai: Arc<dyn AiAnalysis>,
    symbols: Vec<String>,
    jobs: Vec<Arc<JobState>>,
    tickers: Mutex<Vec<JoinHandle<()>>>,

    runs_started: AtomicU64,
    runs_skipped: AtomicU64,
    recommendations_saved: AtomicU64,
    symbol_failures: AtomicU64,
}

impl RecommendationScheduler {
    pub fn new(storage: Arc<dyn Storage>, ai: Arc<dyn AiAnalysis>, symbols: Vec<String>, jobs: Vec<JobSpec>) -> Self {
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        info!(symbols = symbols.len(), jobs = jobs.len(), "Recommendation scheduler created");

        Self {
            storage,
            ai,
            symbols,
            jobs: jobs
                .into_iter()
                .map(|spec| {
                    Arc::new(JobState {
                        spec,
                        running: AtomicBool::new(false),
                    })
                })
                .collect(),
            tickers: Mutex::new(Vec::new()),
            runs_started: AtomicU64::new(0),
            runs_skipped: AtomicU64::new(0),
            recommendations_saved: AtomicU64::new(0),
            symbol_failures: AtomicU64::new(0),
        }
    }

    /// Short-term and long-term jobs over the streamed symbols
    pub fn from_config(
        storage: Arc<dyn Storage>,
        ai: Arc<dyn AiAnalysis>,
        config: &crate::core::ConfigManager,
    ) -> Self {
        Self::new(
            storage,
            ai,
            config.stream().symbols,
            JobSpec::from_config(&config.scheduler()),
        )
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        self.jobs.iter().map(|job| job.spec.clone()).collect()
    }

    /// Analyze one currency over `lookback` and persist the result.
    ///
    /// With a previous recommendation on record the chained analysis is
    /// used, otherwise the primary one.
    pub async fn analyze_and_save(&self, currency: &str, lookback: Duration) -> Result<Recommendation, SchedulerError> {
        let aggregate = self.storage.aggregated_window(currency, lookback).await?;
        let previous = self.storage.latest_recommendation(currency).await?;

        let reply = match &previous {
            Some(prev) => self.ai.analyze_chained(prev, &aggregate).await?,
            None => self.ai.analyze_primary(&aggregate).await?,
        };

        let response = AnalysisResponse::parse(reply)?;
        let saved = self
            .storage
            .insert_recommendation(response.into_recommendation(currency, Utc::now()))
            .await?;

        self.recommendations_saved.fetch_add(1, Ordering::Relaxed);
        info!(
            currency = %saved.currency,
            action = %saved.recommended_action,
            confidence = saved.confidence,
            chained = previous.is_some(),
            events = aggregate.total_count(),
            "Recommendation saved"
        );
        Ok(saved)
    }

    /// Run a job now. Returns `Skipped` if the previous run of the same job
    /// has not finished.
    pub async fn trigger(&self, job_id: &str) -> Result<TickOutcome, SchedulerError> {
        let job = self
            .jobs
            .iter()
            .find(|job| job.spec.id == job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
        Ok(self.run_job(job).await)
    }

    async fn run_job(&self, job: &JobState) -> TickOutcome {
        if job
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.runs_skipped.fetch_add(1, Ordering::Relaxed);
            warn!(job = job.spec.id, "Previous run still in progress, skipping tick");
            return TickOutcome::Skipped;
        }
        let _guard = RunGuard(&job.running);
        self.runs_started.fetch_add(1, Ordering::Relaxed);

        let span = info_span!("recommendation_job", job = job.spec.id, run_id = %Uuid::new_v4());
        self.run_symbols(job.spec.lookback).instrument(span).await
    }

    async fn run_symbols(&self, lookback: Duration) -> TickOutcome {
        info!(symbols = self.symbols.len(), "Job run started");

        let mut succeeded = 0;
        let mut failed = 0;
        for symbol in &self.symbols {
            match self.analyze_and_save(symbol, lookback).await {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    self.symbol_failures.fetch_add(1, Ordering::Relaxed);
                    error!(currency = %symbol, error = %e, "Analysis failed");
                }
            }
        }

        info!(succeeded, failed, "Job run finished");
        TickOutcome::Completed { succeeded, failed }
    }

    /// Spawn one ticker per job. The first tick fires one interval after start.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut tickers = self.tickers.lock();
        if !tickers.is_empty() {
            return Err(SchedulerError::AlreadyStarted);
        }

        for job in &self.jobs {
            let period = job.spec.interval;
            let Some(first_tick) = Instant::now().checked_add(period) else {
                error!(job = job.spec.id, interval_secs = period.as_secs(), "Job interval out of range, not scheduled");
                continue;
            };
            info!(job = job.spec.id, interval_secs = period.as_secs(), "Job scheduled");
            let scheduler = Arc::clone(self);
            let job = Arc::clone(job);
            tickers.push(tokio::spawn(async move {
                let mut ticker = interval_at(first_tick, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    // Runs are detached so a slow run shows up as a skipped tick
                    let scheduler = Arc::clone(&scheduler);
                    let job = Arc::clone(&job);
                    tokio::spawn(async move {
                        scheduler.run_job(&job).await;
                    });
                }
            }));
        }
        Ok(())
    }

    /// Stop scheduling new runs. A run already in progress finishes on its own.
    pub fn stop(&self) {
        let tickers: Vec<JoinHandle<()>> = self.tickers.lock().drain(..).collect();
        for ticker in &tickers {
            ticker.abort();
        }
        if !tickers.is_empty() {
            info!(stats = %self.get_stats(), "Recommendation scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tickers.lock().is_empty()
    }

    pub fn get_stats(&self) -> SchedulerStats {
        SchedulerStats {
            is_running: self.is_running(),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_skipped: self.runs_skipped.load(Ordering::Relaxed),
            recommendations_saved: self.recommendations_saved.load(Ordering::Relaxed),
            symbol_failures: self.symbol_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AggregatedWindow, MarketEvent, MarketKind};
    use crate::layer2::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockAi {
        primary_calls: AtomicU64,
        chained_calls: AtomicU64,
        gate: Option<Arc<Notify>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl AiAnalysis for MockAi {
        async fn analyze_primary(&self, aggregate: &AggregatedWindow) -> Result<Value, AnalysisError> {
            self.primary_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_for.as_deref() == Some(aggregate.currency.as_str()) {
                return Err(AnalysisError::EmptyCompletion);
            }
            Ok(json!({
                "index_gpt": {"up": 60, "down": 40},
                "recommended_action": "buy",
                "events": aggregate.total_count(),
            }))
        }

        async fn analyze_chained(
            &self,
            previous: &Recommendation,
            _aggregate: &AggregatedWindow,
        ) -> Result<Value, AnalysisError> {
            self.chained_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({
                "final_index_gpt": {"confidence": 80},
                "final_recommended_action": format!("hold after {}", previous.recommended_action),
            }))
        }
    }

    fn scheduler(ai: Arc<MockAi>, symbols: &[&str]) -> (Arc<RecommendationScheduler>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let scheduler = RecommendationScheduler::new(
            storage.clone(),
            ai,
            symbols.iter().map(|s| s.to_string()).collect(),
            JobSpec::from_config(&SchedulerConfig::default()),
        );
        (Arc::new(scheduler), storage)
    }

    #[test]
    fn test_job_specs() {
        let jobs = JobSpec::from_config(&SchedulerConfig::default());
        assert_eq!(jobs[0].id, SHORT_TERM_JOB);
        assert_eq!(jobs[0].interval, Duration::from_secs(300));
        assert_eq!(jobs[0].lookback, Duration::from_secs(300));
        assert_eq!(jobs[1].id, LONG_TERM_JOB);
        assert_eq!(jobs[1].lookback, Duration::from_secs(1440 * 60));
    }

    #[test]
    fn test_huge_interval_saturates() {
        let job = JobSpec::every_minutes(LONG_TERM_JOB, u64::MAX);
        assert_eq!(job.interval, Duration::from_secs(u64::MAX));
        assert_eq!(JobSpec::every_minutes(SHORT_TERM_JOB, 0).interval, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_job_is_not_scheduled() {
        let ai = Arc::new(MockAi::default());
        let scheduler = Arc::new(RecommendationScheduler::new(
            Arc::new(MemoryStorage::new()),
            ai.clone(),
            vec!["BTCUSDT".to_string()],
            vec![
                JobSpec::every_minutes(SHORT_TERM_JOB, 5),
                JobSpec::every_minutes(LONG_TERM_JOB, u64::MAX),
            ],
        ));

        scheduler.start().unwrap();
        assert_eq!(scheduler.tickers.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ai.primary_calls.load(Ordering::SeqCst), 1);

        let outcome = scheduler.trigger(LONG_TERM_JOB).await.unwrap();
        assert_eq!(outcome, TickOutcome::Completed { succeeded: 0, failed: 1 });
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_primary_then_chained() {
        let ai = Arc::new(MockAi::default());
        let (scheduler, storage) = scheduler(ai.clone(), &["NEARUSDT"]);
        storage
            .insert_market(&MarketEvent::new("NEARUSDT", MarketKind::Kline, Utc::now(), json!({"close": "3.2"})))
            .await
            .unwrap();

        let first = scheduler.analyze_and_save("NEARUSDT", Duration::from_secs(300)).await.unwrap();
        assert_eq!(first.recommended_action, "buy");
        assert_eq!(first.confidence, 0.0);
        assert_eq!(first.raw_data["events"], 1);

        let second = scheduler.analyze_and_save("NEARUSDT", Duration::from_secs(300)).await.unwrap();
        assert_eq!(second.recommended_action, "hold after buy");
        assert_eq!(second.confidence, 0.8);

        assert_eq!(ai.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ai.chained_calls.load(Ordering::SeqCst), 1);
        assert_eq!(storage.recommendation_count(), 2);
    }

    #[tokio::test]
    async fn test_symbol_failure_does_not_stop_run() {
        let ai = Arc::new(MockAi {
            fail_for: Some("BTCUSDT".into()),
            ..Default::default()
        });
        let (scheduler, storage) = scheduler(ai, &["btcusdt", "ethusdt"]);

        let outcome = scheduler.trigger(SHORT_TERM_JOB).await.unwrap();
        assert_eq!(outcome, TickOutcome::Completed { succeeded: 1, failed: 1 });
        assert_eq!(storage.recommendation_count(), 1);
        assert_eq!(scheduler.get_stats().symbol_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (scheduler, _) = scheduler(Arc::new(MockAi::default()), &["BTCUSDT"]);
        assert!(matches!(scheduler.trigger("hourly").await, Err(SchedulerError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let gate = Arc::new(Notify::new());
        let ai = Arc::new(MockAi {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (scheduler, storage) = scheduler(ai.clone(), &["BTCUSDT"]);

        let running = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.trigger(SHORT_TERM_JOB).await })
        };
        while ai.primary_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(scheduler.trigger(SHORT_TERM_JOB).await.unwrap(), TickOutcome::Skipped);
        // the other job has its own guard
        assert!(!scheduler.jobs[1].running.load(Ordering::SeqCst));

        gate.notify_one();
        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, TickOutcome::Completed { succeeded: 1, failed: 0 });
        assert_eq!(storage.recommendation_count(), 1);

        let stats = scheduler.get_stats();
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.runs_skipped, 1);
        assert!(!scheduler.jobs[0].running.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let ai = Arc::new(MockAi::default());
        let (scheduler, _) = scheduler(ai.clone(), &["BTCUSDT"]);

        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyStarted)));

        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ai.primary_calls.load(Ordering::SeqCst), 1);

        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
