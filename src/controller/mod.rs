pub mod captures;
pub mod context;
pub mod error;
pub mod prober;
pub mod reconciler;
pub mod registry;
pub mod state_machine;
pub mod validation;
pub mod work_queue;

pub use captures::ReplicaCaptures;
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use prober::Prober;
pub use reconciler::{ChangeEvent, Controller, ReconcileOutcome};
pub use registry::{CredentialRevision, Membership, ProberRegistry};
pub use state_machine::{PathState, PathTracker, ScaleState, Streak, Thresholds, decide, transition};
pub use validation::{MIN_PROBE_SECONDS, MIN_RESTORE_REPLICAS, validate_group, validate_target};
pub use work_queue::WorkQueue;
