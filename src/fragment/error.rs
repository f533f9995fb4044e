//! Error types emitted by the reassembly engine.
//!
//! Everything except [`ReassemblyError::Arena`] is local to one identity:
//! the offending submission is rejected (or the reassembly is marked failed)
//! and processing of other identities and packets continues.

use std::num::NonZeroUsize;

use thiserror::Error;

use super::Discipline;
use crate::arena::ArenaError;

/// Why a fragment descriptor was rejected before merging.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MalformedReason {
    /// The payload does not fit in a 32-bit length.
    #[error("payload of {len} bytes exceeds the 32-bit length range")]
    LengthOverflow {
        /// Length of the rejected payload.
        len: usize,
    },
    /// Position plus length wraps past `u32::MAX`.
    #[error("fragment at {position} with length {len} wraps the position range")]
    PositionOverflow {
        /// Claimed fragment position.
        position: u32,
        /// Claimed fragment length.
        len: u32,
    },
}

/// Errors produced by reassembly table operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    /// The fragment's length or position is nonsensical.
    #[error("malformed fragment: {0}")]
    MalformedFragment(#[from] MalformedReason),

    /// Two length claims for the same message cannot both hold.
    ///
    /// The reassembly records the condition and stops completing.
    #[error("unreconcilable length: {existing} already established, {claimed} claimed")]
    UnreconcilableLength {
        /// Length already established.
        existing: u32,
        /// Conflicting length claim.
        claimed: u32,
    },

    /// The reassembly is in its terminal error state.
    #[error("reassembly failed earlier: {reason}")]
    Failed {
        /// Error string recorded on the reassembly.
        reason: String,
    },

    /// The call uses a different discipline than the existing reassembly.
    #[error("discipline mismatch: reassembly uses {expected}, call uses {found}")]
    DisciplineMismatch {
        /// Discipline of the existing reassembly.
        expected: Discipline,
        /// Discipline implied by the call.
        found: Discipline,
    },

    /// The message would exceed the configured size cap.
    #[error("message exceeds size limit: {attempted} bytes > {limit} bytes")]
    MessageTooLarge {
        /// Extent that triggered the guard.
        attempted: u64,
        /// Configured cap.
        limit: NonZeroUsize,
    },

    /// The message already holds the configured number of fragments.
    #[error("message already holds {limit} fragments")]
    TooManyFragments {
        /// Configured cap.
        limit: NonZeroUsize,
    },

    /// No reassembly exists for the identity.
    #[error("no reassembly exists for the identity")]
    NotFound,

    /// Truncation can only shrink a reassembly.
    #[error("cannot truncate {current} to {requested}")]
    InvalidTruncation {
        /// Current total length.
        current: u32,
        /// Requested total length.
        requested: u32,
    },

    /// The completed reassembly's length can no longer change this way.
    #[error("total length {current} is locked; {requested} requires reset or truncate")]
    LengthLocked {
        /// Current total length.
        current: u32,
        /// Requested total length.
        requested: u32,
    },

    /// The session arena cannot hold more state.
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

impl ReassemblyError {
    /// Whether the error should abort the whole analysis session.
    ///
    /// Only arena exhaustion is fatal; every other error concerns a single
    /// identity.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Arena(ArenaError::Exhausted { .. } | ArenaError::AllocationFailed { .. })
        )
    }
}
