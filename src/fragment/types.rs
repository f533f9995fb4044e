//! Fragment descriptors, stored fragments and finished reassemblies.

use std::fmt;

use bincode::{Decode, error::DecodeError};
use bytes::Bytes;

use super::Anomalies;
use crate::{arena::Block, key::FrameNumber};

/// Ordering scheme used to sequence a message's fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Discipline {
    /// Positions are byte offsets into the message.
    ByteOffset,
    /// Positions are zero-based block numbers; the total is a block count.
    BlockSequence,
    /// Fragments carry no position and are appended in arrival order.
    ///
    /// Out-of-order input cannot be reassembled correctly under this
    /// discipline.
    NoSequence,
}

impl Discipline {
    /// Whether positions and totals count blocks rather than bytes.
    #[must_use]
    pub const fn counts_blocks(self) -> bool { !matches!(self, Self::ByteOffset) }

    const fn as_str(self) -> &'static str {
        match self {
            Self::ByteOffset => "byte-offset",
            Self::BlockSequence => "block-sequence",
            Self::NoSequence => "no-sequence",
        }
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One fragment as handed over by a dissector.
///
/// `position` is a byte offset or a block number depending on the call; it
/// is ignored by the no-sequence discipline.
///
/// # Examples
///
/// ```
/// use reassembly::{FragmentDescriptor, FrameNumber};
///
/// let tail = FragmentDescriptor::new(FrameNumber::new(4), 5, b"WORLD").last();
/// assert!(!tail.more_fragments);
/// assert_eq!(tail.position, 5);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentDescriptor<'a> {
    /// Packet the fragment was observed in.
    pub frame: FrameNumber,
    /// Byte offset or block number.
    pub position: u32,
    /// Payload bytes, valid for the duration of the call.
    pub data: &'a [u8],
    /// Whether further fragments follow this one.
    pub more_fragments: bool,
}

impl<'a> FragmentDescriptor<'a> {
    /// Describe a non-final fragment.
    #[must_use]
    pub const fn new(frame: FrameNumber, position: u32, data: &'a [u8]) -> Self {
        Self {
            frame,
            position,
            data,
            more_fragments: true,
        }
    }

    /// Mark the fragment as the final one.
    #[must_use]
    pub const fn last(mut self) -> Self {
        self.more_fragments = false;
        self
    }

    /// Set the more-fragments flag explicitly.
    #[must_use]
    pub const fn with_more_fragments(mut self, more: bool) -> Self {
        self.more_fragments = more;
        self
    }
}

/// Fragment held by a reconstruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub(crate) frame: FrameNumber,
    pub(crate) position: u32,
    pub(crate) len: u32,
    pub(crate) last: bool,
    pub(crate) arrival: u32,
    pub(crate) block: Block,
    pub(crate) anomalies: Anomalies,
}

impl Fragment {
    /// Packet credited with the fragment.
    #[must_use]
    pub const fn frame(&self) -> FrameNumber { self.frame }

    /// Byte offset or block number.
    #[must_use]
    pub const fn position(&self) -> u32 { self.position }

    /// Payload length in bytes.
    #[must_use]
    pub const fn len(&self) -> u32 { self.len }

    /// Whether the payload is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool { self.len == 0 }

    /// Whether the fragment claimed to be final.
    #[must_use]
    pub const fn is_last(&self) -> bool { self.last }

    /// Order of arrival within its reconstruction, starting at zero.
    #[must_use]
    pub const fn arrival(&self) -> u32 { self.arrival }

    /// Anomalies detected when the fragment was inserted.
    #[must_use]
    pub const fn anomalies(&self) -> Anomalies { self.anomalies }

    /// Arena block holding the payload.
    #[must_use]
    pub const fn block(&self) -> Block { self.block }

    /// Exclusive end in the unit of `discipline`.
    pub(crate) fn end(&self, discipline: Discipline) -> u64 {
        let span = if discipline.counts_blocks() {
            1
        } else {
            u64::from(self.len)
        };
        u64::from(self.position) + span
    }

    pub(crate) fn summary(&self) -> FragmentSummary {
        FragmentSummary {
            frame: self.frame,
            position: self.position,
            len: self.len,
            last: self.last,
            anomalies: self.anomalies,
        }
    }
}

/// Provenance of one fragment inside a finished reassembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentSummary {
    /// Packet credited with the fragment.
    pub frame: FrameNumber,
    /// Byte offset or block number.
    pub position: u32,
    /// Payload length in bytes.
    pub len: u32,
    /// Whether the fragment claimed to be final.
    pub last: bool,
    /// Anomalies detected when the fragment was inserted.
    pub anomalies: Anomalies,
}

/// Immutable, shareable result of a completed reassembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reassembled {
    pub(crate) discipline: Discipline,
    pub(crate) data: Bytes,
    pub(crate) total: u32,
    pub(crate) reassembled_in: FrameNumber,
    pub(crate) anomalies: Anomalies,
    pub(crate) fragments: Vec<FragmentSummary>,
}

impl Reassembled {
    /// Discipline the message was reassembled under.
    #[must_use]
    pub const fn discipline(&self) -> Discipline { self.discipline }

    /// Borrow the contiguous payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.data }

    /// Cheap shared handle to the payload.
    #[must_use]
    pub fn bytes(&self) -> Bytes { self.data.clone() }

    /// Consume the result, returning the payload.
    #[must_use]
    pub fn into_bytes(self) -> Bytes { self.data }

    /// Total length: bytes, or blocks for block disciplines.
    #[must_use]
    pub const fn total_len(&self) -> u32 { self.total }

    /// Packet in which the message was completed.
    #[must_use]
    pub const fn reassembled_in(&self) -> FrameNumber { self.reassembled_in }

    /// Anomalies recorded up to completion.
    #[must_use]
    pub const fn anomalies(&self) -> Anomalies { self.anomalies }

    /// Contributing fragments in position order.
    #[must_use]
    pub fn fragments(&self) -> &[FragmentSummary] { &self.fragments }

    /// Decode the payload into a typed message using bincode's standard configuration.
    ///
    /// # Errors
    ///
    /// Returns any [`DecodeError`] raised while deserialising the payload.
    pub fn decode<M: Decode<()>>(&self) -> Result<M, DecodeError> {
        let (message, _) = bincode::decode_from_slice(self.payload(), bincode::config::standard())?;
        Ok(message)
    }
}
