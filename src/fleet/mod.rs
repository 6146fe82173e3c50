//! Worker and job records, and the snapshot the scan cycle works from.
//!
//! The [`Fleet`] store is the only place worker and job records are mutated.
//! Its methods are small single-writer operations; callers hold its lock only
//! for the duration of one method and never across a remote call.

pub mod job;
pub mod store;
pub mod vitals;
pub mod worker;

pub use job::{BuildSpec, InputFile, Job, JobStatus};
pub use store::Fleet;
pub use vitals::{JobVitals, Vitals};
pub use worker::{CleanStatus, ResetProtocol, Worker};
