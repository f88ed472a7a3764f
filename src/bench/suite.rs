//! Suite orchestration
//!
//! A [`Suite`] owns an ordered list of trials sharing one cancellation token.
//! It subscribes itself to every trial, folds each event into the remaining
//! time estimate and passes it through unchanged to its own subscribers.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use super::eta::{EtaEstimator, EtaHandle};
use super::memcopy::MemoryCopy;
use super::purge::CachePurger;
use super::random::{RandomRead, RandomWrite};
use super::sequential::{SequentialRead, SequentialWrite};
use super::status::{ProgressSink, TrialKind, TrialStatus, TrialUpdate};
use super::trial::Trial;
use crate::cancel::CancellationToken;
use crate::config::{EtaSettings, PurgeMode, ScoreWeights, SuiteConfig};
use crate::io::disk::{ByteChannel, TestFile};
use crate::models::ThroughputSampler;
use crate::{Result, SpeedError, SCRATCH_FILE_NAME};

/// Ordered set of trials run one after another on the calling thread
pub struct Suite {
    // dropped before the test file so every handle is closed first
    trials: Vec<Trial>,
    cancellation: CancellationToken,
    sinks: Arc<Mutex<Vec<ProgressSink>>>,
    eta: EtaHandle,
    weights: ScoreWeights,
    write_score: OnceLock<f64>,
    read_score: OnceLock<f64>,
    elapsed: Option<Duration>,
    test_file: Option<TestFile>,
}

impl Suite {
    pub fn new() -> Self {
        Self::with_settings(EtaSettings::default(), ScoreWeights::default())
    }

    pub fn with_settings(eta: EtaSettings, weights: ScoreWeights) -> Self {
        Self {
            trials: Vec::new(),
            cancellation: CancellationToken::new(),
            sinks: Arc::new(Mutex::new(Vec::new())),
            eta: EtaHandle::new(EtaEstimator::new(eta)),
            weights,
            write_score: OnceLock::new(),
            read_score: OnceLock::new(),
            elapsed: None,
            test_file: None,
        }
    }

    /// Build the default suite on a fresh test file in `config.target_dir`:
    /// sequential write, sequential read, random read, random write and,
    /// when enabled, a memory copy baseline.
    pub fn standard(config: &SuiteConfig) -> Result<Self> {
        config.validate()?;

        let test_file = TestFile::in_dir(&config.target_dir, config.file_size, config.bypass_cache)?;
        tracing::info!(
            "Benchmark file {} ({} bytes, cache bypass requested: {})",
            test_file.path().display(),
            test_file.size(),
            config.bypass_cache
        );

        let scratch = config.target_dir.join(SCRATCH_FILE_NAME);
        let purger_for = |bypassed: bool| -> Option<CachePurger> {
            let purge = match config.purge_mode {
                PurgeMode::Always => true,
                PurgeMode::Never => false,
                PurgeMode::Auto => !bypassed,
            };
            purge.then(|| CachePurger::new(scratch.clone(), config.purge.clone()))
        };

        let mut suite = Self::with_settings(config.eta.clone(), config.scores.clone());
        let tune = |trial: Trial| {
            trial
                .with_normalization_threshold(config.normalization_threshold)
                .with_progress_per_percent(config.progress_per_percent)
        };
        let sequential_blocks = config.file_size / config.sequential_block_size;

        let mut write = SequentialWrite::new(
            test_file.write_channel()?,
            config.sequential_block_size,
            sequential_blocks,
        )?
        .with_flush(config.write_through);
        if config.warm_up {
            write = write.with_warm_up(config.warm_up_fraction);
        }
        suite.add_trial(tune(Trial::new(write)));

        let channel = test_file.read_channel()?;
        let purger = purger_for(channel.bypasses_cache());
        let read = SequentialRead::new(channel, config.sequential_block_size)?
            .with_total_blocks(sequential_blocks)?;
        suite.add_trial(tune(with_optional_purger(Trial::new(read), purger)));

        let channel = test_file.read_channel()?;
        let purger = purger_for(channel.bypasses_cache());
        let random_read = RandomRead::new(channel, config.random_block_size, config.random_time_cap)?
            .with_plan_cap(config.random_plan_cap);
        suite.add_trial(tune(with_optional_purger(Trial::new(random_read), purger)));

        let random_write = RandomWrite::new(
            test_file.write_channel()?,
            config.random_block_size,
            config.random_time_cap,
        )?
        .with_plan_cap(config.random_plan_cap)
        .with_arena_size(config.random_write_arena)
        .with_flush(config.write_through);
        suite.add_trial(tune(Trial::new(random_write)));

        if config.memory_copy {
            let blocks = (config.file_size / config.memory_copy_block_size).max(1);
            let copy = MemoryCopy::new(config.memory_copy_block_size, blocks)?;
            suite.add_trial(tune(Trial::new(copy)));
        }

        let mut test_file = test_file;
        if config.keep_test_file {
            test_file.keep_on_drop();
        }
        suite.test_file = Some(test_file);
        Ok(suite)
    }

    /// Append a trial; it shares the suite's cancellation token and reports
    /// through the suite
    pub fn add_trial(&mut self, mut trial: Trial) {
        trial.set_index(self.trials.len());
        trial.set_cancellation(self.cancellation.clone());

        let eta = self.eta.clone();
        let sinks = Arc::clone(&self.sinks);
        trial.subscribe(Arc::new(move |update: &TrialUpdate| {
            eta.with(|estimator| estimator.observe(update));
            let subscribers: Vec<ProgressSink> = sinks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            for sink in &subscribers {
                sink(update);
            }
        }));

        self.eta.with(|estimator| {
            estimator.add_trial(trial.kind(), trial.planned_bytes(), trial.time_cap(), trial.has_purger())
        });
        self.trials.push(trial);
    }

    /// Register a callback receiving every event of every trial
    pub fn subscribe(&self, sink: ProgressSink) {
        self.sinks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sink);
    }

    /// Stop the run after the operation in flight; idempotent
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn eta(&self) -> EtaHandle {
        self.eta.clone()
    }

    pub fn remaining_time(&self) -> Duration {
        self.eta.remaining()
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Results in trial order; `None` for trials that never ran
    pub fn results(&self) -> Vec<Option<Arc<ThroughputSampler>>> {
        self.trials.iter().map(Trial::result).collect()
    }

    /// Wall-clock duration of the last execution
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn test_file(&self) -> Option<&TestFile> {
        self.test_file.as_ref()
    }

    /// Clear all results and issue a fresh cancellation token
    pub fn reset(&mut self) {
        self.cancellation = CancellationToken::new();
        for trial in &mut self.trials {
            trial.set_cancellation(self.cancellation.clone());
        }
        self.clear_results();
    }

    /// Run every trial in order on the calling thread.
    ///
    /// Stops early on cancellation, leaving later trials `NotStarted`. I/O
    /// errors abort the run. A cancelled suite needs [`Suite::reset`] before
    /// it can run again.
    pub fn execute(&mut self) -> Result<()> {
        self.clear_results();
        tracing::info!("Running suite of {} trials", self.trials.len());
        let clock = Instant::now();

        for trial in &mut self.trials {
            if self.cancellation.is_cancelled() {
                tracing::info!("Suite cancelled before {}", trial.name());
                break;
            }
            if let Err(e) = trial.execute() {
                self.elapsed = Some(clock.elapsed());
                return Err(e);
            }
        }

        self.elapsed = Some(clock.elapsed());
        tracing::info!("Suite finished in {:.1}s", clock.elapsed().as_secs_f64());
        Ok(())
    }

    /// Blend of sequential and random write speeds in MB/s
    pub fn write_score(&self) -> Result<f64> {
        if let Some(score) = self.write_score.get() {
            return Ok(*score);
        }
        let score = self.compute_score("write", TrialKind::is_write)?;
        Ok(*self.write_score.get_or_init(|| score))
    }

    /// Blend of sequential and random read speeds in MB/s
    pub fn read_score(&self) -> Result<f64> {
        if let Some(score) = self.read_score.get() {
            return Ok(*score);
        }
        let score = self.compute_score("read", TrialKind::is_read)?;
        Ok(*self.read_score.get_or_init(|| score))
    }

    fn clear_results(&mut self) {
        for trial in &mut self.trials {
            if trial.status() != TrialStatus::NotStarted {
                trial.reset();
            }
        }
        self.eta.with(EtaEstimator::reset);
        self.write_score = OnceLock::new();
        self.read_score = OnceLock::new();
        self.elapsed = None;
    }

    /// Average speed over a fixed traffic mix: `sequential_mb` per
    /// sequential trial and `random_mb` split evenly among random trials,
    /// each moved at the trial's normalized average.
    fn compute_score(&self, direction: &str, selected: fn(TrialKind) -> bool) -> Result<f64> {
        if let Some(trial) = self.trials.iter().find(|t| t.status() != TrialStatus::Completed) {
            return Err(SpeedError::ScoresUnavailable(format!(
                "{} is {}",
                trial.name(),
                trial.status()
            )));
        }

        let trials: Vec<&Trial> = self.trials.iter().filter(|t| selected(t.kind())).collect();
        if trials.is_empty() {
            return Err(SpeedError::ScoresUnavailable(format!("no {} trials", direction)));
        }
        let random_trials = trials.iter().filter(|t| t.kind().is_random()).count();

        let mut traffic = 0.0;
        let mut time = 0.0;
        for trial in trials {
            let rate = trial
                .result()
                .map(|r| r.avg_throughput_normalized())
                .unwrap_or(0.0);
            if rate <= 0.0 {
                return Err(SpeedError::ScoresUnavailable(format!(
                    "{} recorded no samples",
                    trial.name()
                )));
            }
            let size = if trial.kind().is_random() {
                self.weights.random_mb / random_trials as f64
            } else {
                self.weights.sequential_mb
            };
            traffic += size;
            time += size / rate;
        }
        Ok(traffic / time)
    }
}

impl Default for Suite {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suite")
            .field("trials", &self.trials)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("test_file", &self.test_file)
            .finish()
    }
}

fn with_optional_purger(trial: Trial, purger: Option<CachePurger>) -> Trial {
    match purger {
        Some(purger) => trial.with_purger(purger),
        None => trial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulated::SimulatedChannel;
    use crate::util::units::{KIB, MIB};

    fn device(len: u64) -> SimulatedChannel {
        SimulatedChannel::new(len).with_latency(Duration::from_micros(50))
    }

    fn recording(suite: &Suite) -> Arc<Mutex<Vec<TrialUpdate>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        suite.subscribe(Arc::new(move |u: &TrialUpdate| captured.lock().unwrap().push(u.clone())));
        events
    }

    fn small_suite() -> Suite {
        let mut suite = Suite::new();
        suite.add_trial(Trial::new(
            SequentialWrite::new(device(0), 64 * KIB, 8).unwrap(),
        ));
        suite.add_trial(Trial::new(
            SequentialRead::new(device(MIB), 64 * KIB).unwrap(),
        ));
        suite.add_trial(Trial::new(
            RandomRead::new(device(MIB), 4 * KIB, Duration::from_secs(5))
                .unwrap()
                .with_seed(7),
        ));
        suite.add_trial(Trial::new(
            RandomWrite::new(device(MIB), 4 * KIB, Duration::from_secs(5))
                .unwrap()
                .with_arena_size(64 * KIB)
                .with_seed(9),
        ));
        suite
    }

    #[test]
    fn test_events_pass_through_with_indexes() {
        let mut suite = small_suite();
        let events = recording(&suite);

        suite.execute().unwrap();

        let events = events.lock().unwrap();
        let completed: Vec<usize> = events
            .iter()
            .filter(|e| e.status == TrialStatus::Completed)
            .map(|e| e.trial_index)
            .collect();
        assert_eq!(completed, vec![0, 1, 2, 3]);
        assert!(events.iter().all(|e| e.results.is_none() || e.status == TrialStatus::Completed));
        assert_eq!(suite.remaining_time(), Duration::ZERO);
        assert!(suite.elapsed().is_some());
    }

    #[test]
    fn test_scores_require_completion() {
        let suite = small_suite();
        assert!(matches!(suite.write_score(), Err(SpeedError::ScoresUnavailable(_))));
        assert!(matches!(suite.read_score(), Err(SpeedError::ScoresUnavailable(_))));
    }

    #[test]
    fn test_scores_after_completion() {
        let mut suite = small_suite();
        suite.execute().unwrap();

        let write = suite.write_score().unwrap();
        let read = suite.read_score().unwrap();
        assert!(write > 0.0 && write.is_finite());
        assert!(read > 0.0 && read.is_finite());
        // memoized
        assert_eq!(suite.write_score().unwrap(), write);
    }

    #[test]
    fn test_score_weighting() {
        // 800 MB at the sequential rate plus 200 MB at the random rate
        let mut suite = Suite::new();
        suite.add_trial(Trial::new(
            SequentialWrite::new(device(0), MIB, 4).unwrap(),
        ));
        suite.add_trial(Trial::new(
            RandomWrite::new(device(MIB), 4 * KIB, Duration::from_secs(5)).unwrap(),
        ));
        suite.execute().unwrap();

        let rates: Vec<f64> = suite
            .results()
            .iter()
            .map(|r| r.as_ref().unwrap().avg_throughput_normalized())
            .collect();
        let expected = 1000.0 / (800.0 / rates[0] + 200.0 / rates[1]);
        assert!((suite.write_score().unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_cancelled_suite_stops_and_needs_reset() {
        let mut suite = small_suite();
        let token = suite.cancellation().clone();
        suite.subscribe(Arc::new(move |u: &TrialUpdate| {
            if u.trial_index == 1 && u.status == TrialStatus::Running {
                token.cancel();
            }
        }));

        suite.execute().unwrap();
        let statuses: Vec<TrialStatus> = suite.trials().iter().map(Trial::status).collect();
        assert_eq!(
            statuses,
            vec![
                TrialStatus::Completed,
                TrialStatus::Interrupted,
                TrialStatus::NotStarted,
                TrialStatus::NotStarted,
            ]
        );
        assert!(suite.remaining_time() > Duration::ZERO);
        assert!(suite.write_score().is_err());

        suite.reset();
        assert!(!suite.cancellation().is_cancelled());
        assert!(suite.trials().iter().all(|t| t.status() == TrialStatus::NotStarted));

        // the subscriber still cancels the old token, which no trial holds now
        suite.execute().unwrap();
        assert!(suite.trials().iter().all(|t| t.status() == TrialStatus::Completed));
        assert!(suite.write_score().unwrap() > 0.0);
        assert!(suite.read_score().unwrap() > 0.0);
        assert_eq!(suite.remaining_time(), Duration::ZERO);
    }

    #[test]
    fn test_cancelled_suite_without_reset_stays_stopped() {
        let mut suite = small_suite();
        suite.cancel();
        suite.execute().unwrap();
        assert!(suite.trials().iter().all(|t| t.status() == TrialStatus::NotStarted));
        assert!(matches!(suite.read_score(), Err(SpeedError::ScoresUnavailable(_))));
    }

    #[test]
    fn test_io_error_aborts_run() {
        let mut suite = Suite::new();
        suite.add_trial(Trial::new(
            SequentialWrite::new(device(0).fail_after(3), 4 * KIB, 8).unwrap(),
        ));
        suite.add_trial(Trial::new(
            SequentialRead::new(device(MIB), 64 * KIB).unwrap(),
        ));

        assert!(matches!(suite.execute(), Err(SpeedError::TrialIo { .. })));
        assert_eq!(suite.trials()[1].status(), TrialStatus::NotStarted);
    }

    #[test]
    fn test_suite_runs_again_after_completion() {
        let mut suite = small_suite();
        suite.execute().unwrap();
        let first = suite.write_score().unwrap();
        suite.execute().unwrap();
        assert!(suite.write_score().unwrap() > 0.0);
        assert!(first > 0.0);
    }
}
