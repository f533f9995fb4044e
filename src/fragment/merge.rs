//! Merge engine: folds one fragment into a [`Reconstruction`].
//!
//! Submission runs in a fixed order: reject malformed input, drop exact
//! retransmissions, classify overlaps, reconcile final-fragment claims,
//! copy the payload into the session arena, then try to complete. Nothing
//! is mutated before the last fallible step except the terminal error
//! recorded for an unreconcilable tail.

use std::{num::NonZeroUsize, sync::Arc};

use bytes::Bytes;

use super::{
    Anomalies,
    Discipline,
    Fragment,
    FragmentDescriptor,
    MalformedReason,
    ReassemblyError,
    Reassembled,
    Reconstruction,
};
use crate::{
    arena::{Arena, ArenaError, Scope},
    config::ReassemblyConfig,
    key::FrameNumber,
};

/// Limits applied while merging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MergePolicy {
    pub(crate) tolerate_multiple_tails: bool,
    pub(crate) max_message_size: Option<NonZeroUsize>,
    pub(crate) max_fragments: Option<NonZeroUsize>,
}

impl MergePolicy {
    pub(crate) fn check_extent(&self, extent: u64) -> Result<(), ReassemblyError> {
        match self.max_message_size {
            Some(limit) if extent > u64::try_from(limit.get()).unwrap_or(u64::MAX) => {
                Err(ReassemblyError::MessageTooLarge {
                    attempted: extent,
                    limit,
                })
            }
            _ => Ok(()),
        }
    }

    fn check_count(&self, held: usize) -> Result<(), ReassemblyError> {
        match self.max_fragments {
            Some(limit) if held >= limit.get() => Err(ReassemblyError::TooManyFragments { limit }),
            _ => Ok(()),
        }
    }
}

impl Default for MergePolicy {
    fn default() -> Self { Self::from(&ReassemblyConfig::default()) }
}

impl From<&ReassemblyConfig> for MergePolicy {
    fn from(config: &ReassemblyConfig) -> Self {
        Self {
            tolerate_multiple_tails: config.tolerate_multiple_tails,
            max_message_size: config.max_message_size,
            max_fragments: config.max_fragments,
        }
    }
}

/// Result of one submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The fragment was absorbed; the message is not complete.
    Pending,
    /// The fragment completed the message.
    Completed(Arc<Reassembled>),
    /// The fragment repeats data already held and was not stored.
    Duplicate,
}

/// Overlap classification of an incoming fragment.
#[derive(Clone, Copy, Debug, Default)]
struct OverlapCheck {
    anomalies: Anomalies,
    /// Existing fragments already hold exactly these bytes.
    redundant: bool,
}

/// Sorted, disjoint set of claimed byte ranges.
#[derive(Debug, Default)]
struct Coverage {
    ranges: Vec<(u32, u32)>,
}

impl Coverage {
    /// Claim `[start, end)`, returning the sub-ranges not claimed before.
    fn claim(&mut self, start: u32, end: u32) -> Vec<(u32, u32)> {
        let mut fresh = Vec::new();
        let mut cursor = start;
        for &(lo, hi) in &self.ranges {
            if hi <= cursor {
                continue;
            }
            if lo >= end {
                break;
            }
            if lo > cursor {
                fresh.push((cursor, lo));
            }
            cursor = cursor.max(hi);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            fresh.push((cursor, end));
        }

        let at = self.ranges.partition_point(|&(lo, _)| lo < start);
        self.ranges.insert(at, (start, end));
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.ranges.len());
        for &(lo, hi) in &self.ranges {
            match merged.last_mut() {
                Some(last) if lo <= last.1 => last.1 = last.1.max(hi),
                _ => merged.push((lo, hi)),
            }
        }
        self.ranges = merged;
        fresh
    }
}

impl Reconstruction {
    /// Merge `fragment` into the reconstruction.
    ///
    /// `origin` is the packet the fragment was carried in and is what the
    /// stored fragment is credited to; the descriptor's frame is the packet
    /// being processed and becomes the completion frame. They differ only for
    /// out-of-order submissions.
    pub(crate) fn submit(
        &mut self,
        arena: &mut Arena,
        policy: &MergePolicy,
        fragment: &FragmentDescriptor<'_>,
        origin: FrameNumber,
    ) -> Result<Outcome, ReassemblyError> {
        self.ensure_live()?;
        let len = u32::try_from(fragment.data.len()).map_err(|_| MalformedReason::LengthOverflow {
            len: fragment.data.len(),
        })?;

        let position = match self.discipline {
            Discipline::NoSequence => {
                if self.holds_copy_from(arena, origin, fragment.data)? {
                    return Ok(Outcome::Duplicate);
                }
                u32::try_from(self.fragments.len())
                    .map_err(|_| MalformedReason::LengthOverflow { len: self.fragments.len() })?
            }
            _ => fragment.position,
        };
        let span = if self.discipline.counts_blocks() { 1 } else { len };
        let end = position
            .checked_add(span)
            .ok_or(MalformedReason::PositionOverflow { position, len })?;
        let last = !fragment.more_fragments;

        if self.discipline != Discipline::NoSequence
            && self.holds_exact(arena, position, fragment.data, last)?
        {
            return Ok(Outcome::Duplicate);
        }

        if self.defragmented {
            if !self.partial {
                return self.classify_late(policy, position, end, last, fragment.data);
            }
            self.reopen_partial();
        }

        let overlap = match self.discipline {
            Discipline::ByteOffset => self.overlap_bytes(arena, position, end, fragment.data)?,
            Discipline::BlockSequence => self.overlap_blocks(arena, position, fragment.data)?,
            Discipline::NoSequence => OverlapCheck::default(),
        };
        let settles_nothing = !last || self.total == Some(end);
        if overlap.redundant && settles_nothing {
            return Ok(Outcome::Duplicate);
        }

        if !self.discipline.counts_blocks() {
            policy.check_extent(u64::from(end))?;
        }
        policy.check_count(self.fragments.len())?;

        let (new_total, tail_flags) = self.assess_tail(policy, end, last)?;
        let anomalies = overlap.anomalies.union(tail_flags);
        let block = arena.alloc(Scope::Session, fragment.data)?;

        let stored = Fragment {
            frame: origin,
            position,
            len,
            last,
            arrival: self.arrivals,
            block,
            anomalies,
        };
        self.arrivals = self.arrivals.saturating_add(1);
        let at = self.fragments.partition_point(|held| held.position <= position);
        self.fragments.insert(at, stored);
        if let Some(total) = new_total {
            self.total = Some(total);
        }
        self.anomalies = self.anomalies.union(anomalies);
        self.recompute_contiguity();

        Ok(self.try_complete(arena, fragment.frame)?)
    }

    fn holds_copy_from(&self, arena: &Arena, origin: FrameNumber, data: &[u8]) -> Result<bool, ArenaError> {
        for held in self.fragments.iter().filter(|held| held.frame == origin) {
            if arena.resolve(&held.block)? == data {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn holds_exact(&self, arena: &Arena, position: u32, data: &[u8], last: bool) -> Result<bool, ArenaError> {
        let start = self.fragments.partition_point(|held| held.position < position);
        for held in self.fragments[start..]
            .iter()
            .take_while(|held| held.position == position)
        {
            if held.last == last && held.len as usize == data.len() && arena.resolve(&held.block)? == data {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn overlap_bytes(&self, arena: &Arena, position: u32, end: u32, data: &[u8]) -> Result<OverlapCheck, ArenaError> {
        let mut check = OverlapCheck::default();
        for held in &self.fragments {
            let (held_start, held_end) = (held.position, held.position + held.len);
            if held_start >= end {
                break;
            }
            if held_end <= position || held_start == held_end {
                continue;
            }
            let lo = position.max(held_start);
            let hi = end.min(held_end);
            let existing = &arena.resolve(&held.block)?[(lo - held_start) as usize..(hi - held_start) as usize];
            let incoming = &data[(lo - position) as usize..(hi - position) as usize];
            check.anomalies.overlap = true;
            if existing != incoming {
                check.anomalies.overlap_conflict = true;
            }
        }
        check.redundant = check.anomalies.overlap
            && !check.anomalies.overlap_conflict
            && self.covers(position, end);
        Ok(check)
    }

    fn overlap_blocks(&self, arena: &Arena, position: u32, data: &[u8]) -> Result<OverlapCheck, ArenaError> {
        let mut check = OverlapCheck::default();
        let start = self.fragments.partition_point(|held| held.position < position);
        for held in self.fragments[start..]
            .iter()
            .take_while(|held| held.position == position)
        {
            if arena.resolve(&held.block)? == data {
                check.redundant = true;
            } else {
                check.anomalies.overlap = true;
                check.anomalies.overlap_conflict = true;
            }
        }
        if check.redundant {
            check.anomalies = Anomalies::NONE;
        }
        Ok(check)
    }

    /// Whether held fragments cover `[start, end)` without a hole.
    fn covers(&self, start: u32, end: u32) -> bool {
        let mut reach = start;
        for held in &self.fragments {
            if held.position > reach {
                break;
            }
            reach = reach.max(held.position + held.len);
            if reach >= end {
                return true;
            }
        }
        reach >= end
    }

    fn assess_tail(
        &mut self,
        policy: &MergePolicy,
        end: u32,
        last: bool,
    ) -> Result<(Option<u32>, Anomalies), ReassemblyError> {
        let mut flags = Anomalies::NONE;
        if !last {
            if self.total.is_some_and(|total| end > total) {
                flags.too_long = true;
            }
            return Ok((None, flags));
        }

        match self.total {
            Some(total) if total != end => {
                if !policy.tolerate_multiple_tails {
                    return Err(self.fail(total, end));
                }
                flags.multiple_tails = true;
                if end > total {
                    flags.too_long = true;
                }
                Ok((None, flags))
            }
            Some(_) => Ok((None, flags)),
            None => {
                if self.extent() > u64::from(end) {
                    flags.too_long = true;
                }
                Ok((Some(end), flags))
            }
        }
    }

    /// A fragment arriving after completion is never stored; it only
    /// contributes flags when it disagrees with the result.
    ///
    /// A final fragment ending anywhere but the completed total is a second
    /// tail. The strict policy rejects it and leaves the completed message
    /// untouched.
    fn classify_late(
        &mut self,
        policy: &MergePolicy,
        position: u32,
        end: u32,
        last: bool,
        data: &[u8],
    ) -> Result<Outcome, ReassemblyError> {
        let Some(result) = self.result.as_ref() else {
            return Ok(Outcome::Pending);
        };
        let total = result.total;
        let mut flags = Anomalies::NONE;

        match self.discipline {
            Discipline::ByteOffset => {
                if end > total {
                    flags.too_long = true;
                }
                let hi = end.min(total);
                if position < hi {
                    let existing = &result.data[position as usize..hi as usize];
                    if existing != &data[..(hi - position) as usize] {
                        flags.overlap = true;
                        flags.overlap_conflict = true;
                    }
                }
            }
            Discipline::BlockSequence | Discipline::NoSequence => {
                if position >= total {
                    flags.too_long = true;
                } else if block_bytes(result, position).is_some_and(|existing| existing != data) {
                    flags.overlap = true;
                    flags.overlap_conflict = true;
                }
            }
        }

        if last && end != total {
            if !policy.tolerate_multiple_tails {
                return Err(ReassemblyError::UnreconcilableLength {
                    existing: total,
                    claimed: end,
                });
            }
            flags.multiple_tails = true;
        }

        if flags.is_empty() {
            return Ok(Outcome::Duplicate);
        }
        self.anomalies = self.anomalies.union(flags);
        Ok(Outcome::Pending)
    }

    pub(super) fn recompute_contiguity(&mut self) {
        let mut first_gap = None;
        let mut reach: u32 = 0;
        for (index, held) in self.fragments.iter().enumerate() {
            if self.discipline.counts_blocks() {
                if held.position > reach {
                    break;
                }
                if held.position == reach {
                    reach = reach.saturating_add(1);
                }
            } else {
                if held.position > reach {
                    break;
                }
                reach = reach.max(held.position + held.len);
            }
            first_gap = Some(index);
        }
        self.first_gap = first_gap;
        self.contiguous = reach;
    }

    /// Complete the message when the prefix spans the established total.
    pub(super) fn try_complete(&mut self, arena: &Arena, frame: FrameNumber) -> Result<Outcome, ArenaError> {
        if self.defragmented || self.error.is_some() {
            return Ok(Outcome::Pending);
        }
        let Some(total) = self.total else {
            return Ok(Outcome::Pending);
        };
        if self.contiguous < total {
            return Ok(Outcome::Pending);
        }

        let data = if self.discipline.counts_blocks() {
            self.assemble_blocks(arena, total)?
        } else {
            self.assemble_bytes(arena, total)?
        };
        let result = Arc::new(Reassembled {
            discipline: self.discipline,
            data,
            total,
            reassembled_in: frame,
            anomalies: self.anomalies,
            fragments: self.fragments.iter().map(Fragment::summary).collect(),
        });
        self.defragmented = true;
        self.reassembled_in = Some(frame);
        self.result = Some(Arc::clone(&result));
        Ok(Outcome::Completed(result))
    }

    /// Conflicting bytes resolve to the earliest arrival.
    fn assemble_bytes(&self, arena: &Arena, total: u32) -> Result<Bytes, ArenaError> {
        let mut buffer = vec![0_u8; total as usize];
        let mut claimed = Coverage::default();
        let mut by_arrival: Vec<&Fragment> = self.fragments.iter().collect();
        by_arrival.sort_by_key(|held| held.arrival);

        for held in by_arrival {
            let start = held.position;
            let end = (held.position + held.len).min(total);
            if start >= end {
                continue;
            }
            let bytes = arena.resolve(&held.block)?;
            for (lo, hi) in claimed.claim(start, end) {
                buffer[lo as usize..hi as usize]
                    .copy_from_slice(&bytes[(lo - start) as usize..(hi - start) as usize]);
            }
        }
        Ok(Bytes::from(buffer))
    }

    fn assemble_blocks(&self, arena: &Arena, total: u32) -> Result<Bytes, ArenaError> {
        let mut buffer = Vec::new();
        let mut next = 0;
        for held in &self.fragments {
            if next >= total {
                break;
            }
            if held.position == next {
                buffer.extend_from_slice(arena.resolve(&held.block)?);
                next += 1;
            }
        }
        Ok(Bytes::from(buffer))
    }
}

/// Bytes the completed block message took from block `position`.
fn block_bytes(result: &Reassembled, position: u32) -> Option<&[u8]> {
    let mut offset = 0_usize;
    let mut seen = None;
    for summary in &result.fragments {
        if seen == Some(summary.position) || summary.position >= result.total {
            continue;
        }
        seen = Some(summary.position);
        let len = summary.len as usize;
        if summary.position == position {
            return result.data.get(offset..offset + len);
        }
        offset += len;
    }
    None
}
