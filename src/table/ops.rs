//! Submission and length-control operations on [`ReassemblyTable`].

use std::sync::Arc;

use log::{debug, warn};

use super::{ReassemblyTable, report_anomalies};
use crate::{
    arena::Arena,
    fragment::{
        Discipline,
        FragmentDescriptor,
        ReassemblyError,
        Reassembled,
        Reconstruction,
        merge::{MergePolicy, Outcome},
    },
    key::{FrameNumber, KeyInput},
    metrics,
};

/// Whether a completed reconstruction moves into the result table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Promotion {
    Keep,
    Promote,
}

/// Outcome of every `add*` operation: the completed message, or `None` while
/// fragments are still missing.
pub type AddResult = Result<Option<Arc<Reassembled>>, ReassemblyError>;

impl ReassemblyTable {
    /// Add a byte-offset fragment.
    ///
    /// The completed message stays in the fragment table; a later exact
    /// retransmission from the completing packet returns it again.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError`] for malformed fragments, configured limits,
    /// discipline mismatches, unreconcilable lengths and arena exhaustion.
    pub fn add(&mut self, key: &KeyInput<'_>, fragment: FragmentDescriptor<'_>) -> AddResult {
        self.submit(key, Discipline::ByteOffset, &fragment, fragment.frame, Promotion::Keep)
    }

    /// Add a byte-offset fragment carried in packet `origin` but handed over
    /// while processing `fragment.frame`.
    ///
    /// # Errors
    ///
    /// As for [`ReassemblyTable::add`].
    pub fn add_out_of_order(
        &mut self,
        key: &KeyInput<'_>,
        fragment: FragmentDescriptor<'_>,
        origin: FrameNumber,
    ) -> AddResult {
        self.submit(key, Discipline::ByteOffset, &fragment, origin, Promotion::Keep)
    }

    /// Add a byte-offset fragment, consulting the result table first.
    ///
    /// A cached result for the identity is returned unchanged whatever the
    /// fragment holds. First-time completion moves the message into the
    /// result table.
    ///
    /// # Errors
    ///
    /// As for [`ReassemblyTable::add`].
    pub fn add_check(&mut self, key: &KeyInput<'_>, fragment: FragmentDescriptor<'_>) -> AddResult {
        if let Some(cached) = self.cached(key) {
            return Ok(Some(cached));
        }
        self.submit(key, Discipline::ByteOffset, &fragment, fragment.frame, Promotion::Promote)
    }

    /// Like [`ReassemblyTable::add_check`], but links to the result cached
    /// under `fallback` when `key` has neither a result nor a reconstruction.
    ///
    /// The linked result is shared, not re-verified against the fragment.
    ///
    /// # Errors
    ///
    /// As for [`ReassemblyTable::add`].
    pub fn add_check_with_fallback(
        &mut self,
        key: &KeyInput<'_>,
        fallback: &KeyInput<'_>,
        fragment: FragmentDescriptor<'_>,
    ) -> AddResult {
        if let Some(cached) = self.cached(key) {
            return Ok(Some(cached));
        }
        if self.reconstruction(key).is_none()
            && let Some(linked) = self.get_reassembled(fallback)
        {
            debug!(
                "reassembly linked to fallback: table={}, id={}, fallback_id={}, reassembled_in={}",
                self.name,
                key.id,
                fallback.id,
                linked.reassembled_in()
            );
            let persistent = self.keys.make_persistent_key(key);
            return Ok(Some(self.results.insert(persistent, linked)));
        }
        self.submit(key, Discipline::ByteOffset, &fragment, fragment.frame, Promotion::Promote)
    }

    /// Add a fragment whose position is a block number.
    ///
    /// # Errors
    ///
    /// As for [`ReassemblyTable::add`].
    pub fn add_seq(&mut self, key: &KeyInput<'_>, fragment: FragmentDescriptor<'_>) -> AddResult {
        self.submit(key, Discipline::BlockSequence, &fragment, fragment.frame, Promotion::Keep)
    }

    /// Add a block-numbered fragment with result-table promotion.
    ///
    /// # Errors
    ///
    /// As for [`ReassemblyTable::add`].
    pub fn add_seq_check(&mut self, key: &KeyInput<'_>, fragment: FragmentDescriptor<'_>) -> AddResult {
        if let Some(cached) = self.cached(key) {
            return Ok(Some(cached));
        }
        self.submit(key, Discipline::BlockSequence, &fragment, fragment.frame, Promotion::Promote)
    }

    /// Append a fragment that carries no position.
    ///
    /// The descriptor's position is ignored; the fragment becomes the next
    /// block. Out-of-order input cannot be reassembled correctly this way.
    ///
    /// # Errors
    ///
    /// As for [`ReassemblyTable::add`].
    pub fn add_seq_next(&mut self, key: &KeyInput<'_>, fragment: FragmentDescriptor<'_>) -> AddResult {
        if let Some(cached) = self.cached(key) {
            return Ok(Some(cached));
        }
        self.submit(key, Discipline::NoSequence, &fragment, fragment.frame, Promotion::Promote)
    }

    /// Register a block-sequence reassembly expecting `blocks` fragments.
    ///
    /// Does nothing when the identity already has a reconstruction.
    pub fn start_expecting(&mut self, key: &KeyInput<'_>, blocks: u32) {
        let temp = self.keys.make_temp_key(key);
        self.fragments
            .entry(temp)
            .or_insert_with(|| Reconstruction::expecting(blocks));
    }

    /// Establish the total length learned out of band.
    ///
    /// Completion triggered here credits `frame`. When a final fragment or an
    /// earlier call already fixed a different total, that total is kept and
    /// the multiple-tails anomaly is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::NotFound`] for an unknown identity,
    /// [`ReassemblyError::LengthLocked`] when a completed message would change
    /// length, and [`ReassemblyError::UnreconcilableLength`] when a held block
    /// lies beyond `total` or, with strict tails, when `total` disagrees with
    /// the established one.
    pub fn set_total_length(&mut self, key: &KeyInput<'_>, total: u32, frame: FrameNumber) -> AddResult {
        self.control(key, |reconstruction, arena, policy| {
            reconstruction.set_total_length(arena, policy, total, frame)
        })
    }

    /// Replace the total length; a larger total reopens a completed message.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::NotFound`] for an unknown identity,
    /// [`ReassemblyError::LengthLocked`] when shrinking a completed message,
    /// and [`ReassemblyError::UnreconcilableLength`] when a held block lies
    /// beyond `total`.
    pub fn reset_total_length(&mut self, key: &KeyInput<'_>, total: u32, frame: FrameNumber) -> AddResult {
        self.control(key, |reconstruction, arena, policy| {
            reconstruction.reset_total_length(arena, policy, total, frame)
        })
    }

    /// Complete the message with the prefix received so far.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::NotFound`] for an unknown identity.
    pub fn end(&mut self, key: &KeyInput<'_>, frame: FrameNumber) -> AddResult {
        self.control(key, |reconstruction, arena, _| reconstruction.end(arena, frame))
    }

    /// Shrink a byte-offset message to `new_total` bytes.
    ///
    /// Applies to an in-progress reconstruction or a cached result. Returns
    /// the replacement result when the message was already complete, or the
    /// new result when the retained prefix now spans `new_total`.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::NotFound`] for an unknown identity,
    /// [`ReassemblyError::InvalidTruncation`] when `new_total` would grow the
    /// message and [`ReassemblyError::DisciplineMismatch`] for block messages.
    pub fn truncate(&mut self, key: &KeyInput<'_>, new_total: u32) -> AddResult {
        let mut completed = None;
        let truncated = match self
            .keys
            .find_temp_key(key)
            .and_then(|temp| self.fragments.get_mut(&temp))
        {
            Some(reconstruction) => {
                let was_complete = reconstruction.is_defragmented();
                let truncated = reconstruction.truncate(&self.arena, new_total);
                if !was_complete && let Ok(Some(result)) = &truncated {
                    completed = Some(Arc::clone(result));
                }
                truncated
            }
            None => {
                let persistent = self.keys.make_persistent_key(key);
                self.results.truncate(&persistent, new_total).map(Some)
            }
        };
        match &truncated {
            Ok(_) => debug!(
                "reassembly truncated: table={}, id={}, total={new_total}",
                self.name, key.id
            ),
            Err(err) => self.report_error(key, err),
        }
        if let Some(result) = completed {
            self.note_completion(key, &result);
        }
        truncated
    }

    /// Let a completed message accept further fragments.
    ///
    /// The next submission clears the completed state and merging resumes,
    /// as continuous-stream desegmentation requires.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::NotFound`] for an unknown identity.
    pub fn set_partial_reassembly(&mut self, key: &KeyInput<'_>) -> Result<(), ReassemblyError> {
        let temp = self.keys.find_temp_key(key).ok_or(ReassemblyError::NotFound)?;
        let reconstruction = self.fragments.get_mut(&temp).ok_or(ReassemblyError::NotFound)?;
        reconstruction.set_partial_reassembly();
        Ok(())
    }

    fn cached(&self, key: &KeyInput<'_>) -> Option<Arc<Reassembled>> {
        let cached = self.get_reassembled(key)?;
        metrics::inc_fragments(&self.name);
        Some(cached)
    }

    fn submit(
        &mut self,
        key: &KeyInput<'_>,
        discipline: Discipline,
        fragment: &FragmentDescriptor<'_>,
        origin: FrameNumber,
        promotion: Promotion,
    ) -> AddResult {
        metrics::inc_fragments(&self.name);
        let merged = self.merge(key, discipline, fragment, origin, promotion);
        if let Err(err) = &merged {
            self.report_error(key, err);
        }
        merged
    }

    fn merge(
        &mut self,
        key: &KeyInput<'_>,
        discipline: Discipline,
        fragment: &FragmentDescriptor<'_>,
        origin: FrameNumber,
        promotion: Promotion,
    ) -> AddResult {
        // A new identity is only interned once its first fragment is accepted.
        let temp = self.keys.find_temp_key(key);
        let mut fresh = Reconstruction::new(discipline);
        let held = temp.as_ref().and_then(|temp| self.fragments.get_mut(temp));
        let created = held.is_none();
        let reconstruction = held.unwrap_or(&mut fresh);
        if reconstruction.discipline() != discipline {
            return Err(ReassemblyError::DisciplineMismatch {
                expected: reconstruction.discipline(),
                found: discipline,
            });
        }

        let before = reconstruction.anomalies();
        let submitted = reconstruction.submit(&mut self.arena, &self.policy, fragment, origin);
        report_anomalies(&self.name, &self.config, key, before, reconstruction.anomalies());

        let result = match submitted? {
            Outcome::Completed(result) => result,
            outcome => {
                let replayed = match outcome {
                    Outcome::Duplicate => reconstruction
                        .result()
                        .filter(|result| result.reassembled_in() == fragment.frame)
                        .cloned(),
                    _ => None,
                };
                if created {
                    self.adopt(key, fresh);
                }
                return Ok(replayed);
            }
        };

        self.note_completion(key, &result);
        if promotion == Promotion::Keep {
            if created {
                self.adopt(key, fresh);
            }
            return Ok(Some(result));
        }
        if let Some(temp) = temp.filter(|_| !created) {
            self.fragments.remove(&temp);
        }
        let persistent = self.keys.make_persistent_key(key);
        debug!(
            "reassembly promoted: table={}, key={persistent}",
            self.name
        );
        Ok(Some(self.results.insert(persistent, result)))
    }

    fn adopt(&mut self, key: &KeyInput<'_>, reconstruction: Reconstruction) {
        let temp = self.keys.make_temp_key(key);
        self.fragments.insert(temp, reconstruction);
    }

    fn control(
        &mut self,
        key: &KeyInput<'_>,
        op: impl FnOnce(&mut Reconstruction, &Arena, &MergePolicy) -> Result<Outcome, ReassemblyError>,
    ) -> AddResult {
        let controlled = self.apply_control(key, op);
        if let Err(err) = &controlled {
            self.report_error(key, err);
        }
        controlled
    }

    fn apply_control(
        &mut self,
        key: &KeyInput<'_>,
        op: impl FnOnce(&mut Reconstruction, &Arena, &MergePolicy) -> Result<Outcome, ReassemblyError>,
    ) -> AddResult {
        let temp = self.keys.find_temp_key(key).ok_or(ReassemblyError::NotFound)?;
        let reconstruction = self.fragments.get_mut(&temp).ok_or(ReassemblyError::NotFound)?;
        let before = reconstruction.anomalies();
        let outcome = op(reconstruction, &self.arena, &self.policy);
        report_anomalies(&self.name, &self.config, key, before, reconstruction.anomalies());

        match outcome? {
            Outcome::Pending => Ok(None),
            Outcome::Duplicate => Ok(reconstruction.result().cloned()),
            Outcome::Completed(result) => {
                self.note_completion(key, &result);
                Ok(Some(result))
            }
        }
    }

    fn note_completion(&self, key: &KeyInput<'_>, result: &Reassembled) {
        metrics::inc_completed(&self.name);
        debug!(
            "reassembly complete: table={}, flow={}, id={}, len={}, reassembled_in={}, anomalies={}",
            self.name,
            key.flow,
            key.id,
            result.payload().len(),
            result.reassembled_in(),
            result.anomalies()
        );
    }

    fn report_error(&self, key: &KeyInput<'_>, err: &ReassemblyError) {
        metrics::inc_errors(&self.name);
        if err.is_fatal() {
            warn!(
                "reassembly aborted: table={}, flow={}, id={}, error={err}",
                self.name, key.flow, key.id
            );
        } else {
            debug!(
                "reassembly rejected: table={}, flow={}, id={}, error={err}",
                self.name, key.flow, key.id
            );
        }
    }
}
