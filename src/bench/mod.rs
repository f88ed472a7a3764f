//! Benchmark engine
//!
//! Trials, their workloads and the suite that runs them in order, plus the
//! cache purger, access plans and remaining-time estimation they rely on.

pub mod eta;
pub mod memcopy;
pub mod plan;
pub mod purge;
pub mod random;
pub mod runner;
pub mod sequential;
pub mod status;
pub mod suite;
pub mod trial;

pub use eta::{EtaBreakdown, EtaEstimator, EtaHandle};
pub use memcopy::MemoryCopy;
pub use plan::AccessPlan;
pub use purge::{CachePurger, PurgeReport};
pub use random::{RandomRead, RandomWrite};
pub use runner::{run_suite, RunOutcome, RunnerEvent, SuiteRun};
pub use sequential::{SequentialRead, SequentialWrite};
pub use status::{ProgressSink, TrialKind, TrialStatus, TrialUpdate};
pub use suite::Suite;
pub use trial::{Trial, Workload};
