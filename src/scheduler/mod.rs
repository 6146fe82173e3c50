//! Worker lifecycle and job dispatch.
//!
//! - [`Cleaner`]: resets a worker to a dispatchable state
//! - [`Dispatcher`]: starts the next job on a clean idle worker
//! - [`FleetScanner`]: the periodic loop driving both, and polling running builds
//! - [`CandidateSelector`] and [`BuildBehaviour`]: the capability interfaces
//!   through which job selection and build-type knowledge plug in

pub mod behaviour;
pub mod cleaner;
pub mod dispatcher;
pub mod scan;
pub mod selector;

pub use behaviour::{
    BehaviourRegistry, BoundBehaviour, BuildBehaviour, BuildOutcome, StagedBuildBehaviour,
};
pub use cleaner::{CleanAction, CleanOutcome, Cleaner};
pub use dispatcher::Dispatcher;
pub use scan::{FleetScanner, ScanOutcome};
pub use selector::{CandidateSelector, QueueSelector};
