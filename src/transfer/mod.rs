//! Staging build inputs on workers and fetching files back from them.
//!
//! Both directions go through a shared [`TransferPool`] that caps how many
//! transfers run against one remote host at a time.

pub mod pool;
pub mod stager;

pub use pool::TransferPool;
pub use stager::FileStager;
