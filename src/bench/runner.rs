//! Async front end for a [`Suite`].
//!
//! The suite runs on Tokio's blocking pool; its events are forwarded over an
//! unbounded channel together with the remaining-time estimate, so the worker
//! never waits on a slow consumer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::eta::EtaHandle;
use super::status::TrialUpdate;
use super::suite::Suite;
use crate::cancel::CancellationToken;
use crate::{Result, SpeedError};

/// Trial event as seen by an async consumer
#[derive(Debug, Clone)]
pub struct RunnerEvent {
    pub update: TrialUpdate,
    /// Suite remaining time right after `update` was applied
    pub remaining: Duration,
}

/// Suite handed back when the worker finishes
#[derive(Debug)]
pub struct RunOutcome {
    pub suite: Suite,
    /// Outcome of [`Suite::execute`]
    pub result: Result<()>,
}

/// Handle to a suite running in the background
pub struct SuiteRun {
    events: mpsc::UnboundedReceiver<RunnerEvent>,
    handle: JoinHandle<(Suite, Result<()>)>,
    cancellation: CancellationToken,
    eta: EtaHandle,
}

/// Start `suite` on the blocking pool. Must be called from within a Tokio
/// runtime.
pub fn run_suite(mut suite: Suite) -> SuiteRun {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = Arc::new(Mutex::new(Some(tx)));
    let eta = suite.eta();

    let forward = Arc::clone(&sender);
    let estimate = eta.clone();
    suite.subscribe(Arc::new(move |update: &TrialUpdate| {
        let guard = forward.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = guard.as_ref() {
            // a dropped receiver only means nobody is watching
            let _ = tx.send(RunnerEvent {
                update: update.clone(),
                remaining: estimate.remaining(),
            });
        }
    }));

    let cancellation = suite.cancellation().clone();
    let handle = tokio::task::spawn_blocking(move || {
        let result = suite.execute();
        if let Err(e) = &result {
            tracing::error!("Suite aborted: {}", e);
        }
        // close the event stream; the sink stays registered on the suite
        sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        (suite, result)
    });

    SuiteRun {
        events: rx,
        handle,
        cancellation,
        eta,
    }
}

impl SuiteRun {
    /// Next event, or `None` once the suite has stopped
    pub async fn next_event(&mut self) -> Option<RunnerEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn remaining(&self) -> Duration {
        self.eta.remaining()
    }

    /// Wait for the worker and take the suite back
    pub async fn finish(self) -> Result<RunOutcome> {
        let (suite, result) = self
            .handle
            .await
            .map_err(|e| SpeedError::WorkerError(format!("Suite worker failed: {}", e)))?;
        Ok(RunOutcome { suite, result })
    }
}

impl std::fmt::Debug for SuiteRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteRun")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{SequentialRead, SequentialWrite, Trial, TrialStatus};
    use crate::io::simulated::SimulatedChannel;
    use crate::util::units::KIB;

    fn suite(latency: Duration, blocks: u64) -> Suite {
        let mut suite = Suite::new();
        suite.add_trial(Trial::new(
            SequentialWrite::new(SimulatedChannel::new(0).with_latency(latency), 64 * KIB, blocks).unwrap(),
        ));
        suite.add_trial(Trial::new(
            SequentialRead::new(
                SimulatedChannel::new(blocks * 64 * KIB).with_latency(latency),
                64 * KIB,
            )
            .unwrap(),
        ));
        suite
    }

    #[tokio::test]
    async fn test_events_stream_until_completion() {
        let mut run = run_suite(suite(Duration::from_micros(100), 16));

        let mut events = Vec::new();
        while let Some(event) = run.next_event().await {
            events.push(event);
        }

        let last = events.last().unwrap();
        assert_eq!(last.update.status, TrialStatus::Completed);
        assert_eq!(last.update.trial_index, 1);
        assert_eq!(last.remaining, Duration::ZERO);

        let outcome = run.finish().await.unwrap();
        assert!(outcome.result.is_ok());
        assert!(outcome
            .suite
            .trials()
            .iter()
            .all(|t| t.status() == TrialStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancel_from_async_side() {
        let mut run = run_suite(suite(Duration::from_millis(20), 500));

        while let Some(event) = run.next_event().await {
            if event.update.is_progress() {
                run.cancel();
            }
        }

        let outcome = run.finish().await.unwrap();
        assert!(outcome.result.is_ok());
        let trials = outcome.suite.trials();
        assert_eq!(trials[0].status(), TrialStatus::Interrupted);
        assert_eq!(trials[1].status(), TrialStatus::NotStarted);
    }
}
