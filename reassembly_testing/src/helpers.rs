//! Builders for flows, fragments and table drives used across tests.

use std::{net::Ipv4Addr, sync::Arc};

use bytes::Bytes;
use reassembly::{
    AddResult,
    FlowKey,
    FragmentDescriptor,
    FrameNumber,
    KeyInput,
    Reassembled,
    ReassemblyConfig,
    ReassemblyTable,
};
use rstest::fixture;

/// Flow between two documentation addresses.
#[fixture]
#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
pub fn flow() -> FlowKey { FlowKey::new(Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(192, 0, 2, 2)) }

/// Empty table with the default configuration.
#[fixture]
#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
pub fn table() -> ReassemblyTable { ReassemblyTable::new("test", ReassemblyConfig::default()) }

/// Fragment with owned payload, convenient for shuffling and replaying.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedFragment {
    /// Packet carrying the fragment.
    pub frame: FrameNumber,
    /// Byte offset or block number.
    pub position: u32,
    /// Payload bytes.
    pub data: Bytes,
    /// Whether the fragment is the final one.
    pub last: bool,
}

impl OwnedFragment {
    /// Build a fragment carried in `frame`.
    pub fn new(frame: u32, position: u32, data: impl Into<Bytes>, last: bool) -> Self {
        Self {
            frame: FrameNumber::new(frame),
            position,
            data: data.into(),
            last,
        }
    }

    /// Borrowed descriptor for the table API.
    pub fn descriptor(&self) -> FragmentDescriptor<'_> {
        FragmentDescriptor::new(self.frame, self.position, &self.data).with_more_fragments(!self.last)
    }
}

/// Split `payload` into byte-offset fragments of at most `chunk` bytes.
///
/// Fragment `n` is carried in frame `n + 1`; the last one sets the final flag.
///
/// # Panics
///
/// Panics if `chunk` is zero or the payload exceeds `u32::MAX` bytes.
pub fn split_bytes(payload: &[u8], chunk: usize) -> Vec<OwnedFragment> {
    let count = payload.chunks(chunk).count();
    payload
        .chunks(chunk)
        .enumerate()
        .map(|(index, piece)| {
            OwnedFragment::new(
                u32::try_from(index + 1).expect("frame fits in u32"),
                u32::try_from(index * chunk).expect("offset fits in u32"),
                Bytes::copy_from_slice(piece),
                index + 1 == count,
            )
        })
        .collect()
}

/// Split `payload` into block-numbered fragments of at most `chunk` bytes.
///
/// # Panics
///
/// Panics if `chunk` is zero.
pub fn split_blocks(payload: &[u8], chunk: usize) -> Vec<OwnedFragment> {
    let mut fragments = split_bytes(payload, chunk);
    for (block, fragment) in fragments.iter_mut().enumerate() {
        fragment.position = u32::try_from(block).expect("block fits in u32");
    }
    fragments
}

/// Feed `fragments` to [`ReassemblyTable::add`] in order.
pub fn add_all(table: &mut ReassemblyTable, key: &KeyInput<'_>, fragments: &[OwnedFragment]) -> Vec<AddResult> {
    fragments
        .iter()
        .map(|fragment| table.add(key, fragment.descriptor()))
        .collect()
}

/// Feed `fragments` to [`ReassemblyTable::add_seq`] in order.
pub fn add_seq_all(table: &mut ReassemblyTable, key: &KeyInput<'_>, fragments: &[OwnedFragment]) -> Vec<AddResult> {
    fragments
        .iter()
        .map(|fragment| table.add_seq(key, fragment.descriptor()))
        .collect()
}

/// Messages completed by a drive, in the order they were returned.
///
/// # Panics
///
/// Panics if any submission returned an error.
pub fn completions(results: Vec<AddResult>) -> Vec<Arc<Reassembled>> {
    results
        .into_iter()
        .filter_map(|result| result.expect("submission accepted"))
        .collect()
}
