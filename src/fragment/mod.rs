//! Fragment model and merge engine.
//!
//! This module collects the types that describe fragments, the per-message
//! [`Reconstruction`] state, and the algorithms that fold fragments into a
//! contiguous [`Reassembled`] payload under each [`Discipline`]. Tables in
//! [`crate::table`] route fragments to reconstructions by identity; nothing
//! here knows about keys.

pub mod anomalies;
pub mod error;
pub(crate) mod merge;
pub mod reconstruction;
pub mod types;

pub use anomalies::{Anomalies, AnomalyKind};
pub use error::{MalformedReason, ReassemblyError};
pub use reconstruction::{Reconstruction, ReconstructionState};
pub use types::{Discipline, Fragment, FragmentDescriptor, FragmentSummary, Reassembled};
