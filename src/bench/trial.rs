//! Trial orchestration
//!
//! Every trial variant implements [`Workload`]; a single [`Trial`] loop
//! drives the lifecycle, timing, sampling, progress reporting and
//! cancellation for all of them.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::plan::AccessPlan;
use super::purge::CachePurger;
use super::status::{ProgressSink, TrialKind, TrialStatus, TrialUpdate};
use crate::cancel::CancellationToken;
use crate::io::buffer::AllocError;
use crate::io::memory::release_freed_memory;
use crate::models::sampler::{ThroughputSampler, DEFAULT_NORMALIZATION_THRESHOLD};
use crate::util::units::format_bytes;
use crate::{Result, SpeedError};

/// One kind of timed measurement.
///
/// Constructors validate parameters; `prepare` only allocates. The trial
/// loop calls `perform` once per planned offset and times nothing itself:
/// the returned duration covers exactly the measured operation.
pub trait Workload: Send {
    /// Display name including the block size
    fn name(&self) -> String;

    fn kind(&self) -> TrialKind;

    fn block_size(&self) -> u64;

    /// Allocate buffers. Called once per execution, before any I/O.
    fn prepare(&mut self) -> std::result::Result<(), AllocError>;

    /// Offsets to measure, excluding warm-up
    fn plan(&mut self) -> Result<AccessPlan>;

    /// Unrecorded blocks to run before measuring
    fn warm_up_blocks(&self) -> u64 {
        0
    }

    /// Soft limit after which progress reads 100%
    fn time_cap(&self) -> Option<Duration> {
        None
    }

    /// Bytes the trial moves when it runs to the end of its plan, if known
    /// before execution
    fn planned_bytes(&self) -> Option<u64>;

    /// Whether samples are tagged with their byte offset
    fn records_positions(&self) -> bool {
        true
    }

    /// Whether the channel this workload reads bypasses the OS cache
    fn bypasses_cache(&self) -> bool {
        false
    }

    /// Return to the start of the plan
    fn rewind(&mut self) -> io::Result<()>;

    /// Perform one block operation at `offset` and return its duration
    fn perform(&mut self, offset: u64) -> io::Result<Duration>;

    /// Drop buffers allocated by `prepare`
    fn release(&mut self);
}

/// One timed measurement and its lifecycle.
///
/// A trial executes once; [`Trial::reset`] makes it runnable again.
pub struct Trial {
    workload: Box<dyn Workload>,
    status: TrialStatus,
    index: usize,
    cancellation: CancellationToken,
    purger: Option<CachePurger>,
    sinks: Vec<ProgressSink>,
    normalization_threshold: f64,
    progress_per_percent: bool,
    result: Option<Arc<ThroughputSampler>>,
    started: Option<Instant>,
}

impl Trial {
    pub fn new<W: Workload + 'static>(workload: W) -> Self {
        Self::from_boxed(Box::new(workload))
    }

    pub fn from_boxed(workload: Box<dyn Workload>) -> Self {
        Self {
            workload,
            status: TrialStatus::NotStarted,
            index: 0,
            cancellation: CancellationToken::new(),
            purger: None,
            sinks: Vec::new(),
            normalization_threshold: DEFAULT_NORMALIZATION_THRESHOLD,
            progress_per_percent: false,
            result: None,
            started: None,
        }
    }

    /// Purge the OS cache before measuring
    pub fn with_purger(mut self, purger: CachePurger) -> Self {
        self.purger = Some(purger);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_normalization_threshold(mut self, threshold: f64) -> Self {
        self.normalization_threshold = threshold;
        self
    }

    /// Emit a progress event only when the whole percentage grows, rather
    /// than after every block
    pub fn with_progress_per_percent(mut self, enabled: bool) -> Self {
        self.progress_per_percent = enabled;
        self
    }

    pub fn name(&self) -> String {
        self.workload.name()
    }

    pub fn kind(&self) -> TrialKind {
        self.workload.kind()
    }

    pub fn block_size(&self) -> u64 {
        self.workload.block_size()
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn time_cap(&self) -> Option<Duration> {
        self.workload.time_cap()
    }

    pub fn planned_bytes(&self) -> Option<u64> {
        self.workload.planned_bytes()
    }

    pub fn has_purger(&self) -> bool {
        self.purger.is_some()
    }

    /// Samples of the last execution, once it has returned
    pub fn result(&self) -> Option<Arc<ThroughputSampler>> {
        self.result.clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Register a callback for status and progress events
    pub fn subscribe(&mut self, sink: ProgressSink) {
        self.sinks.push(sink);
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub(crate) fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancellation = token;
    }

    /// Request the running execution to stop before its next operation
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Return to `NotStarted`, discarding the previous result
    pub fn reset(&mut self) {
        self.status = TrialStatus::NotStarted;
        self.result = None;
        self.started = None;
    }

    /// Run the trial on the calling thread.
    ///
    /// Returns the samples recorded so far; the sampler is empty when
    /// buffers could not be allocated or cancellation came first. I/O
    /// errors abort the trial and are returned with its name and block
    /// size attached.
    pub fn execute(&mut self) -> Result<Arc<ThroughputSampler>> {
        if self.status != TrialStatus::NotStarted {
            return Err(SpeedError::BenchmarkError(format!(
                "{} already ran ({}); reset it first",
                self.name(),
                self.status
            )));
        }

        self.started = Some(Instant::now());
        self.set_status(TrialStatus::Started);
        tracing::info!("Starting {}", self.name());

        let outcome = self.run();
        self.workload.release();
        release_freed_memory();

        let sampler = Arc::new(outcome?);
        self.result = Some(Arc::clone(&sampler));

        match self.status {
            TrialStatus::Completed => {
                tracing::info!(
                    "{} completed: {:.2} MB/s normalized, {:.2} MB/s real over {} samples",
                    self.name(),
                    sampler.avg_throughput_normalized(),
                    sampler.avg_throughput_real(),
                    sampler.len()
                );
                self.emit(TrialStatus::Completed, None, None, Some(Arc::clone(&sampler)));
            }
            status => {
                tracing::info!("{} ended: {} after {} samples", self.name(), status, sampler.len());
                self.emit(status, None, None, None);
            }
        }

        Ok(sampler)
    }

    fn run(&mut self) -> Result<ThroughputSampler> {
        let mut sampler = ThroughputSampler::with_threshold(
            self.workload.block_size(),
            self.normalization_threshold,
        );

        self.set_status(TrialStatus::InitializingBuffer);
        if let Err(e) = self.workload.prepare() {
            tracing::warn!("{}: {}", self.name(), e);
            self.status = TrialStatus::InsufficientMemory;
            return Ok(sampler);
        }

        let plan = self.workload.plan()?;

        if let Some(purger) = &self.purger {
            self.status = TrialStatus::PurgingCache;
            self.emit(TrialStatus::PurgingCache, None, None, None);
            let is_cancelled = self.cancellation.as_predicate();
            purger.purge(&is_cancelled);
        }

        if self.cancellation.is_cancelled() {
            self.status = TrialStatus::Interrupted;
            return Ok(sampler);
        }

        let warm_up = self.workload.warm_up_blocks();
        if warm_up > 0 && !plan.is_empty() {
            self.set_status(TrialStatus::WarmingUp);
            if !self.warm_up(&plan, warm_up)? {
                self.status = TrialStatus::Interrupted;
                return Ok(sampler);
            }
        }

        self.set_status(TrialStatus::Running);
        self.measure(&plan, &mut sampler)?;
        Ok(sampler)
    }

    /// Returns `false` when cancelled
    fn warm_up(&mut self, plan: &AccessPlan, blocks: u64) -> Result<bool> {
        self.workload.rewind().map_err(|e| self.io_error(e))?;
        for i in 0..blocks {
            if self.cancellation.is_cancelled() {
                return Ok(false);
            }
            let offset = plan.offset(i % plan.len()).unwrap_or(0);
            self.workload.perform(offset).map_err(|e| self.io_error(e))?;
        }
        Ok(true)
    }

    fn measure(&mut self, plan: &AccessPlan, sampler: &mut ThroughputSampler) -> Result<()> {
        let total = plan.len();
        let time_cap = self.workload.time_cap();
        let positions = self.workload.records_positions();
        self.workload.rewind().map_err(|e| self.io_error(e))?;
        let clock = Instant::now();
        let mut last_percent: i64 = -1;

        for (i, offset) in plan.iter().enumerate() {
            if self.cancellation.is_cancelled() {
                sampler.set_total_time(clock.elapsed());
                self.status = TrialStatus::Interrupted;
                return Ok(());
            }

            let elapsed = self.workload.perform(offset).map_err(|e| self.io_error(e))?;
            sampler.record_block(elapsed, positions.then_some(offset))?;

            let percent = progress_percent(i as u64 + 1, total, clock.elapsed(), time_cap);
            let whole = percent.floor() as i64;
            if !self.progress_per_percent || whole > last_percent {
                last_percent = whole;
                let recent = sampler.recent_average();
                self.emit(
                    TrialStatus::Running,
                    Some(percent),
                    (recent > 0.0).then_some(recent),
                    None,
                );
            }
            if percent >= 100.0 {
                break;
            }
        }

        sampler.set_total_time(clock.elapsed());
        self.status = TrialStatus::Completed;
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> SpeedError {
        SpeedError::TrialIo {
            trial: self.name(),
            block_size: self.workload.block_size(),
            source,
        }
    }

    fn set_status(&mut self, status: TrialStatus) {
        self.status = status;
        self.emit(status, None, None, None);
    }

    fn emit(
        &self,
        status: TrialStatus,
        progress_percent: Option<f64>,
        recent_rate: Option<f64>,
        results: Option<Arc<ThroughputSampler>>,
    ) {
        if self.sinks.is_empty() {
            return;
        }
        let update = TrialUpdate {
            trial_index: self.index,
            name: self.name(),
            kind: self.kind(),
            status,
            progress_percent,
            recent_rate,
            elapsed_ms: self.started.map(|s| s.elapsed().as_millis() as u64),
            results,
        };
        for sink in &self.sinks {
            sink(&update);
        }
    }
}

impl std::fmt::Debug for Trial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trial")
            .field("name", &self.name())
            .field("status", &self.status)
            .field("index", &self.index)
            .finish()
    }
}

/// Name shown for a trial, e.g. `Random read [4.0 KiB block]`
pub(crate) fn display_name(kind: TrialKind, block_size: u64) -> String {
    format!("{} [{} block]", kind, format_bytes(block_size))
}

/// Displayed progress: the larger of the block ratio and the time ratio,
/// capped at 100.
pub(crate) fn progress_percent(done: u64, total: u64, elapsed: Duration, time_cap: Option<Duration>) -> f64 {
    let blocks = if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    };
    let time = match time_cap {
        Some(cap) if !cap.is_zero() => elapsed.as_secs_f64() * 100.0 / cap.as_secs_f64(),
        _ => 0.0,
    };
    blocks.max(time).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Workload with fixed per-operation durations and no I/O
    struct FakeWorkload {
        blocks: u64,
        warm_up: u64,
        fail_prepare: bool,
        fail_at: Option<u64>,
        performed: Arc<Mutex<Vec<u64>>>,
        released: Arc<Mutex<bool>>,
    }

    impl FakeWorkload {
        fn new(blocks: u64) -> Self {
            Self {
                blocks,
                warm_up: 0,
                fail_prepare: false,
                fail_at: None,
                performed: Arc::new(Mutex::new(Vec::new())),
                released: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl Workload for FakeWorkload {
        fn name(&self) -> String {
            "Fake [1KB] block".to_string()
        }

        fn kind(&self) -> TrialKind {
            TrialKind::SequentialRead
        }

        fn block_size(&self) -> u64 {
            1024
        }

        fn prepare(&mut self) -> std::result::Result<(), AllocError> {
            if self.fail_prepare {
                Err(AllocError { requested: 1024 })
            } else {
                Ok(())
            }
        }

        fn plan(&mut self) -> Result<AccessPlan> {
            Ok(AccessPlan::sequential(1024, self.blocks))
        }

        fn warm_up_blocks(&self) -> u64 {
            self.warm_up
        }

        fn planned_bytes(&self) -> Option<u64> {
            Some(self.blocks * 1024)
        }

        fn rewind(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn perform(&mut self, offset: u64) -> io::Result<Duration> {
            let mut performed = self.performed.lock().unwrap();
            if Some(performed.len() as u64) == self.fail_at {
                return Err(io::Error::new(io::ErrorKind::Other, "boom"));
            }
            performed.push(offset);
            Ok(Duration::from_millis(1))
        }

        fn release(&mut self) {
            *self.released.lock().unwrap() = true;
        }
    }

    fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<TrialUpdate>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        let sink: ProgressSink = Arc::new(move |u: &TrialUpdate| captured.lock().unwrap().push(u.clone()));
        (sink, events)
    }

    fn statuses(events: &[TrialUpdate]) -> Vec<TrialStatus> {
        events.iter().filter(|e| !e.is_progress()).map(|e| e.status).collect()
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(TrialKind::RandomRead, 4096), "Random read [4.0 KiB block]");
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(1, 4, Duration::ZERO, None), 25.0);
        assert_eq!(progress_percent(1, 100, Duration::from_secs(5), Some(Duration::from_secs(10))), 50.0);
        assert_eq!(progress_percent(1, 100, Duration::from_secs(30), Some(Duration::from_secs(10))), 100.0);
        assert_eq!(progress_percent(0, 0, Duration::ZERO, None), 100.0);
    }

    #[test]
    fn test_complete_lifecycle() {
        let mut trial = Trial::new(FakeWorkload::new(10));
        let (sink, events) = recording_sink();
        trial.subscribe(sink);

        let result = trial.execute().unwrap();
        assert_eq!(result.len(), 10);
        assert!(result.has_positions());
        assert_eq!(trial.status(), TrialStatus::Completed);

        let events = events.lock().unwrap();
        assert_eq!(
            statuses(&events),
            vec![
                TrialStatus::Started,
                TrialStatus::InitializingBuffer,
                TrialStatus::Running,
                TrialStatus::Completed,
            ]
        );
        let last = events.last().unwrap();
        assert!(last.results.is_some());
        assert_eq!(events.iter().filter(|e| e.is_progress()).count(), 10);
    }

    #[test]
    fn test_progress_after_every_block() {
        let mut trial = Trial::new(FakeWorkload::new(1000));
        let (sink, events) = recording_sink();
        trial.subscribe(sink);

        trial.execute().unwrap();
        let events = events.lock().unwrap();
        let progress: Vec<f64> = events.iter().filter_map(|e| e.progress_percent).collect();
        assert_eq!(progress.len(), 1000);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last(), Some(&100.0));
    }

    #[test]
    fn test_progress_per_percent_is_opt_in() {
        let mut trial = Trial::new(FakeWorkload::new(1000)).with_progress_per_percent(true);
        let (sink, events) = recording_sink();
        trial.subscribe(sink);

        let result = trial.execute().unwrap();
        assert_eq!(result.len(), 1000);
        // 0% on the first block, then every whole percent up to 100
        assert_eq!(events.lock().unwrap().iter().filter(|e| e.is_progress()).count(), 101);
    }

    #[test]
    fn test_empty_plan_completes_without_samples() {
        let mut trial = Trial::new(FakeWorkload::new(0));
        let (sink, events) = recording_sink();
        trial.subscribe(sink);

        let result = trial.execute().unwrap();
        assert!(result.is_empty());
        assert_eq!(trial.status(), TrialStatus::Completed);
        let events = events.lock().unwrap();
        assert!(events.iter().all(|e| !e.is_progress()));
        assert!(events.last().unwrap().results.is_some());
    }

    #[test]
    fn test_warm_up_is_not_recorded() {
        let workload = FakeWorkload {
            warm_up: 3,
            ..FakeWorkload::new(20)
        };
        let performed = Arc::clone(&workload.performed);
        let mut trial = Trial::new(workload);
        let (sink, events) = recording_sink();
        trial.subscribe(sink);

        let result = trial.execute().unwrap();
        assert_eq!(result.len(), 20);
        assert_eq!(performed.lock().unwrap().len(), 23);
        assert!(statuses(&events.lock().unwrap()).contains(&TrialStatus::WarmingUp));
    }

    #[test]
    fn test_allocation_failure() {
        let workload = FakeWorkload {
            fail_prepare: true,
            ..FakeWorkload::new(5)
        };
        let performed = Arc::clone(&workload.performed);
        let mut trial = Trial::new(workload);

        let result = trial.execute().unwrap();
        assert!(result.is_empty());
        assert_eq!(trial.status(), TrialStatus::InsufficientMemory);
        assert!(performed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_before_start_interrupts() {
        let workload = FakeWorkload::new(5);
        let released = Arc::clone(&workload.released);
        let mut trial = Trial::new(workload);
        trial.cancel();

        let result = trial.execute().unwrap();
        assert!(result.is_empty());
        assert_eq!(trial.status(), TrialStatus::Interrupted);
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn test_cancel_from_sink_stops_after_current_block() {
        let mut trial = Trial::new(FakeWorkload::new(100));
        let token = trial.cancellation().clone();
        trial.subscribe(Arc::new(move |u: &TrialUpdate| {
            if u.progress_percent.unwrap_or(0.0) >= 10.0 {
                token.cancel();
            }
        }));

        let result = trial.execute().unwrap();
        assert_eq!(trial.status(), TrialStatus::Interrupted);
        assert_eq!(result.len(), 10);
    }

    #[test]
    fn test_io_error_carries_context() {
        let workload = FakeWorkload {
            fail_at: Some(2),
            ..FakeWorkload::new(5)
        };
        let released = Arc::clone(&workload.released);
        let mut trial = Trial::new(workload);

        match trial.execute() {
            Err(SpeedError::TrialIo { trial: name, block_size, .. }) => {
                assert!(name.starts_with("Fake"));
                assert_eq!(block_size, 1024);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn test_execute_twice_requires_reset() {
        let mut trial = Trial::new(FakeWorkload::new(2));
        trial.execute().unwrap();
        assert!(matches!(trial.execute(), Err(SpeedError::BenchmarkError(_))));

        trial.reset();
        assert_eq!(trial.status(), TrialStatus::NotStarted);
        assert!(trial.result().is_none());
        assert_eq!(trial.execute().unwrap().len(), 2);
    }
}
