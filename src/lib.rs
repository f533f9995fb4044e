#![doc(html_root_url = "https://docs.rs/reassembly/latest")]
//! Public API for the `reassembly` library.
//!
//! This crate rebuilds messages that a protocol split across several packets.
//! Dissectors register a [`ReassemblyTable`] per protocol, hand it fragments
//! keyed by flow and message identifier, and receive the contiguous payload
//! once every piece has arrived, together with the anomalies seen on the way.

pub mod arena;
pub mod config;
pub mod fragment;
pub mod key;
pub mod metrics;
pub mod script;
pub mod session;
pub mod table;
pub mod tree;

pub use arena::{Arena, ArenaError, Block, Scope};
pub use config::ReassemblyConfig;
pub use fragment::{
    Anomalies,
    AnomalyKind,
    Discipline,
    FragmentDescriptor,
    FragmentSummary,
    MalformedReason,
    Reassembled,
    ReassemblyError,
    Reconstruction,
    ReconstructionState,
};
pub use key::{Address, FlowKey, FrameNumber, KeyInput, KeyScheme, MessageId, PersistentKey};
pub use metrics::{ANOMALIES_TOTAL, COMPLETED_TOTAL, ERRORS_TOTAL, FRAGMENTS_TOTAL};
pub use session::SessionContext;
pub use table::{AddResult, Lookup, ReassemblyTable, ResultTable};
