//! In-progress reassembly state for one message identity.
//!
//! A [`Reconstruction`] owns the fragment list of one message, sorted by
//! position, together with the bookkeeping the merge engine needs: the
//! contiguous prefix, the expected total, accumulated anomalies and, once
//! complete, the shared [`Reassembled`] result. The length operations in this
//! file are the explicit ways a caller can change the expected total after
//! fragments have arrived.

use std::sync::Arc;

use super::{
    Anomalies,
    Discipline,
    Fragment,
    ReassemblyError,
    Reassembled,
    merge::{MergePolicy, Outcome},
};
use crate::{arena::Arena, key::FrameNumber};

/// Lifecycle stage of a [`Reconstruction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconstructionState {
    /// Registered but no fragment has arrived yet.
    Empty,
    /// Fragments are arriving; the message is not complete.
    Accumulating,
    /// The message spans `[0, total)` and a result exists.
    Defragmented,
    /// An unrecoverable condition was recorded. Terminal.
    Failed,
}

/// Reassembly state for one message identity.
#[derive(Clone, Debug)]
pub struct Reconstruction {
    pub(super) discipline: Discipline,
    pub(super) fragments: Vec<Fragment>,
    pub(super) first_gap: Option<usize>,
    pub(super) contiguous: u32,
    pub(super) total: Option<u32>,
    pub(super) anomalies: Anomalies,
    pub(super) defragmented: bool,
    pub(super) partial: bool,
    pub(super) reassembled_in: Option<FrameNumber>,
    pub(super) error: Option<String>,
    pub(super) result: Option<Arc<Reassembled>>,
    pub(super) arrivals: u32,
}

impl Reconstruction {
    /// Create an empty reconstruction for `discipline`.
    #[must_use]
    pub fn new(discipline: Discipline) -> Self {
        Self {
            discipline,
            fragments: Vec::new(),
            first_gap: None,
            contiguous: 0,
            total: None,
            anomalies: Anomalies::NONE,
            defragmented: false,
            partial: false,
            reassembled_in: None,
            error: None,
            result: None,
            arrivals: 0,
        }
    }

    /// Create a block-sequence reconstruction expecting `blocks` fragments.
    #[must_use]
    pub fn expecting(blocks: u32) -> Self {
        let mut reconstruction = Self::new(Discipline::BlockSequence);
        reconstruction.total = Some(blocks);
        reconstruction
    }

    /// Discipline the reconstruction was created with.
    #[must_use]
    pub const fn discipline(&self) -> Discipline { self.discipline }

    /// Fragments in position order; ties keep arrival order.
    #[must_use]
    pub fn fragments(&self) -> &[Fragment] { &self.fragments }

    /// Last fragment of the contiguous prefix, if the prefix is non-empty.
    #[must_use]
    pub fn first_gap(&self) -> Option<&Fragment> {
        self.first_gap.and_then(|index| self.fragments.get(index))
    }

    /// Length of the gap-free prefix starting at zero, in bytes or blocks.
    #[must_use]
    pub const fn contiguous_len(&self) -> u32 { self.contiguous }

    /// Expected total in bytes or blocks, once established.
    #[must_use]
    pub const fn total_len(&self) -> Option<u32> { self.total }

    /// Anomalies recorded so far.
    #[must_use]
    pub const fn anomalies(&self) -> Anomalies { self.anomalies }

    /// Whether the message has been completed.
    #[must_use]
    pub const fn is_defragmented(&self) -> bool { self.defragmented }

    /// Whether a completed message will reopen on the next submission.
    #[must_use]
    pub const fn is_partial(&self) -> bool { self.partial }

    /// Packet in which the message was completed.
    #[must_use]
    pub const fn reassembled_in(&self) -> Option<FrameNumber> { self.reassembled_in }

    /// Error string recorded on unrecoverable corruption.
    #[must_use]
    pub fn error(&self) -> Option<&str> { self.error.as_deref() }

    /// Shared result of the completed message.
    #[must_use]
    pub fn result(&self) -> Option<&Arc<Reassembled>> { self.result.as_ref() }

    /// Consume the reconstruction, keeping only its result.
    #[must_use]
    pub fn into_result(self) -> Option<Arc<Reassembled>> { self.result }

    /// Current lifecycle stage.
    #[must_use]
    pub fn state(&self) -> ReconstructionState {
        if self.error.is_some() {
            ReconstructionState::Failed
        } else if self.defragmented {
            ReconstructionState::Defragmented
        } else if self.fragments.is_empty() {
            ReconstructionState::Empty
        } else {
            ReconstructionState::Accumulating
        }
    }

    /// Highest end reached by any fragment, in bytes or blocks.
    #[must_use]
    pub fn extent(&self) -> u64 {
        self.fragments
            .iter()
            .map(|fragment| fragment.end(self.discipline))
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn ensure_live(&self) -> Result<(), ReassemblyError> {
        match &self.error {
            Some(reason) => Err(ReassemblyError::Failed {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Record an unrecoverable condition; the reconstruction stops completing.
    pub(crate) fn fail(&mut self, existing: u32, claimed: u32) -> ReassemblyError {
        let err = ReassemblyError::UnreconcilableLength { existing, claimed };
        self.error = Some(err.to_string());
        err
    }

    fn reopen_with_total(&mut self, total: Option<u32>) {
        self.defragmented = false;
        self.result = None;
        self.reassembled_in = None;
        self.total = total;
    }

    /// Reopen a completed message flagged for partial reassembly.
    pub(super) fn reopen_partial(&mut self) {
        self.partial = false;
        self.reopen_with_total(None);
        self.anomalies.multiple_tails = false;
        self.anomalies.too_long = false;
    }

    /// Establish the expected total.
    ///
    /// A total already fixed by a final fragment or an earlier call only
    /// changes through [`Reconstruction::reset_total_length`]; a different
    /// claim is recorded as a second tail.
    pub(crate) fn set_total_length(
        &mut self,
        arena: &Arena,
        policy: &MergePolicy,
        total: u32,
        frame: FrameNumber,
    ) -> Result<Outcome, ReassemblyError> {
        self.ensure_live()?;
        if self.defragmented {
            return match self.total {
                Some(current) if current == total => Ok(Outcome::Pending),
                current => Err(ReassemblyError::LengthLocked {
                    current: current.unwrap_or(0),
                    requested: total,
                }),
            };
        }
        if let Some(current) = self.total
            && current != total
        {
            if !policy.tolerate_multiple_tails {
                return Err(self.fail(current, total));
            }
            self.anomalies.multiple_tails = true;
            return Ok(Outcome::Pending);
        }

        self.admit_total(policy, total)?;
        if self.extent() > u64::from(total) {
            self.anomalies.too_long = true;
        }

        self.total = Some(total);
        Ok(self.try_complete(arena, frame)?)
    }

    /// Replace the expected total, reopening a completed message that grows.
    pub(crate) fn reset_total_length(
        &mut self,
        arena: &Arena,
        policy: &MergePolicy,
        total: u32,
        frame: FrameNumber,
    ) -> Result<Outcome, ReassemblyError> {
        self.ensure_live()?;
        if self.defragmented {
            let current = self.total.unwrap_or(0);
            if total == current {
                return Ok(Outcome::Pending);
            }
            if total < current {
                return Err(ReassemblyError::LengthLocked {
                    current,
                    requested: total,
                });
            }
        }

        self.admit_total(policy, total)?;
        if self.defragmented {
            self.reopen_with_total(Some(total));
        } else {
            self.total = Some(total);
        }

        if self.extent() > u64::from(total) {
            self.anomalies.too_long = true;
        }
        Ok(self.try_complete(arena, frame)?)
    }

    /// Check a new total against held blocks or the size cap.
    fn admit_total(&mut self, policy: &MergePolicy, total: u32) -> Result<(), ReassemblyError> {
        if !self.discipline.counts_blocks() {
            return policy.check_extent(u64::from(total));
        }
        match self.fragments.iter().map(|f| f.position).max() {
            Some(max) if max >= total => Err(self.fail(max.saturating_add(1), total)),
            _ => Ok(()),
        }
    }

    /// Cut a byte-offset message down to `new_total` bytes.
    ///
    /// Fragments starting past the cut are discarded and a fragment crossing
    /// it is shortened. A completed message keeps its completion frame and
    /// gets a fresh result holding the retained prefix. An in-progress message
    /// whose retained prefix now spans the cut completes, credited to the
    /// packet of its most recent surviving fragment.
    pub(crate) fn truncate(
        &mut self,
        arena: &Arena,
        new_total: u32,
    ) -> Result<Option<Arc<Reassembled>>, ReassemblyError> {
        self.ensure_live()?;
        if self.discipline != Discipline::ByteOffset {
            return Err(ReassemblyError::DisciplineMismatch {
                expected: self.discipline,
                found: Discipline::ByteOffset,
            });
        }

        let current = self
            .total
            .unwrap_or_else(|| u32::try_from(self.extent()).unwrap_or(u32::MAX));
        if new_total > current {
            return Err(ReassemblyError::InvalidTruncation {
                current,
                requested: new_total,
            });
        }

        self.fragments.retain(|fragment| fragment.position < new_total);
        for fragment in &mut self.fragments {
            let end = fragment.position + fragment.len;
            if end > new_total {
                fragment.len = new_total - fragment.position;
                fragment.block = fragment.block.truncated(fragment.len as usize);
            }
        }
        self.total = Some(new_total);
        self.recompute_contiguity();

        if !self.defragmented {
            let Some(frame) = self
                .fragments
                .iter()
                .max_by_key(|fragment| fragment.arrival)
                .map(|fragment| fragment.frame)
            else {
                return Ok(None);
            };
            return match self.try_complete(arena, frame)? {
                Outcome::Completed(result) => Ok(Some(result)),
                Outcome::Pending | Outcome::Duplicate => Ok(None),
            };
        }
        let Some(previous) = self.result.take() else {
            return Ok(None);
        };
        let truncated = Arc::new(Reassembled {
            discipline: previous.discipline,
            data: previous.data.slice(..new_total as usize),
            total: new_total,
            reassembled_in: previous.reassembled_in,
            anomalies: self.anomalies,
            fragments: self.fragments.iter().map(Fragment::summary).collect(),
        });
        self.result = Some(Arc::clone(&truncated));
        Ok(Some(truncated))
    }

    /// Complete the message with whatever prefix is present.
    pub(crate) fn end(&mut self, arena: &Arena, frame: FrameNumber) -> Result<Outcome, ReassemblyError> {
        self.ensure_live()?;
        if self.defragmented {
            return Ok(Outcome::Duplicate);
        }
        if self.extent() > u64::from(self.contiguous) {
            self.anomalies.too_long = true;
        }
        self.total = Some(self.contiguous);
        Ok(self.try_complete(arena, frame)?)
    }

    /// Let a completed message accept further fragments.
    pub(crate) fn set_partial_reassembly(&mut self) { self.partial = true; }
}
