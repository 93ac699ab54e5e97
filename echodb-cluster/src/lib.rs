//! # EchoDB Cluster Coordination
//!
//! Leader election and cluster bookkeeping over the same object store that
//! holds the data. There is no consensus protocol here: leadership is a
//! cooperative, time-bounded lease under last-writer-wins PUT semantics,
//! safe as long as every participant respects expiry with a clock skew
//! bound well under the lease duration.

pub mod election;
pub mod monitor;
pub mod registry;

pub use election::{LeaderElection, LeaderRecord, RecoveryCallback};
pub use monitor::LeaderMonitor;
pub use registry::LeaderRegistry;
