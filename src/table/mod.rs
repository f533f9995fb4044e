//! Reassembly tables: the surface protocol dissectors call.
//!
//! A [`ReassemblyTable`] routes fragments to per-identity
//! [`Reconstruction`]s held in its fragment table, promotes finished messages
//! into a [`ResultTable`] for the `*_check` operations, and owns the session
//! arena every stored fragment lives in. The `add*` and length operations
//! live in `ops.rs`; this file holds construction, lookups and housekeeping.

mod ops;
pub mod results;

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use log::{debug, warn};

pub use self::{ops::AddResult, results::ResultTable};
use crate::{
    arena::{Arena, Scope},
    config::ReassemblyConfig,
    fragment::{Anomalies, Reassembled, Reconstruction, merge::MergePolicy},
    key::{KeyFactory, KeyInput, TempKey},
    metrics,
};

/// Entry found by [`ReassemblyTable::get`].
#[derive(Clone, Copy, Debug)]
pub enum Lookup<'a> {
    /// Reconstruction held in the fragment table.
    Reconstruction(&'a Reconstruction),
    /// Completed result held in the result table.
    Reassembled(&'a Arc<Reassembled>),
}

impl<'a> Lookup<'a> {
    /// Completed result, when the entry has one.
    #[must_use]
    pub fn result(self) -> Option<&'a Arc<Reassembled>> {
        match self {
            Self::Reconstruction(reconstruction) => reconstruction.result(),
            Self::Reassembled(result) => Some(result),
        }
    }

    /// In-progress reconstruction, when the entry is one.
    #[must_use]
    pub fn reconstruction(self) -> Option<&'a Reconstruction> {
        match self {
            Self::Reconstruction(reconstruction) => Some(reconstruction),
            Self::Reassembled(_) => None,
        }
    }
}

/// Fragment table, result table and session arena for one protocol.
///
/// # Examples
///
/// ```
/// use std::net::Ipv4Addr;
///
/// use reassembly::{
///     FlowKey,
///     FragmentDescriptor,
///     FrameNumber,
///     KeyInput,
///     MessageId,
///     ReassemblyConfig,
///     ReassemblyTable,
/// };
///
/// let mut table = ReassemblyTable::new("ipv4", ReassemblyConfig::default());
/// let flow = FlowKey::new(Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(192, 0, 2, 9));
/// let key = KeyInput::new(&flow, MessageId::new(0x1c46));
///
/// let tail = FragmentDescriptor::new(FrameNumber::new(2), 5, b"WORLD").last();
/// assert!(table.add(&key, tail).expect("tail accepted").is_none());
///
/// let head = FragmentDescriptor::new(FrameNumber::new(3), 0, b"HELLO");
/// let message = table.add(&key, head).expect("head accepted").expect("complete");
/// assert_eq!(message.payload(), b"HELLOWORLD");
/// assert_eq!(message.reassembled_in(), FrameNumber::new(3));
/// ```
#[derive(Debug)]
pub struct ReassemblyTable {
    name: String,
    config: ReassemblyConfig,
    policy: MergePolicy,
    keys: KeyFactory,
    arena: Arena,
    fragments: HashMap<TempKey, Reconstruction>,
    results: ResultTable,
}

impl ReassemblyTable {
    /// Create an empty table named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ReassemblyConfig) -> Self {
        Self {
            name: name.into(),
            policy: MergePolicy::from(&config),
            keys: KeyFactory::new(config.key_scheme),
            arena: Arena::new(config.arena_chunk_size, config.arena_limit),
            fragments: HashMap::new(),
            results: ResultTable::default(),
            config,
        }
    }

    /// Name used in logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Configuration the table was created with.
    #[must_use]
    pub const fn config(&self) -> &ReassemblyConfig { &self.config }

    /// Arena holding fragment payloads.
    #[must_use]
    pub const fn arena(&self) -> &Arena { &self.arena }

    /// Key factory interning this table's flows.
    #[must_use]
    pub const fn keys(&self) -> &KeyFactory { &self.keys }

    /// Completed results promoted by the `*_check` operations.
    #[must_use]
    pub const fn results(&self) -> &ResultTable { &self.results }

    /// Number of identities held in the fragment table.
    #[must_use]
    pub fn in_progress(&self) -> usize { self.fragments.len() }

    /// Drop all state and release the session arena.
    ///
    /// Called at the start of every capture. Blocks handed out earlier become
    /// stale; results already returned as `Arc`s stay readable.
    pub fn init(&mut self) {
        debug!(
            "reassembly table reset: table={}, in_progress={}, completed={}",
            self.name,
            self.fragments.len(),
            self.results.len()
        );
        self.fragments.clear();
        self.results.clear();
        self.keys.clear();
        self.arena.reset(Scope::Session);
    }

    /// Release per-packet scratch space.
    pub fn end_packet(&mut self) { self.arena.reset(Scope::Packet); }

    /// Look up the entry for `key`, preferring the fragment table.
    #[must_use]
    pub fn get(&self, key: &KeyInput<'_>) -> Option<Lookup<'_>> {
        if let Some(reconstruction) = self.reconstruction(key) {
            return Some(Lookup::Reconstruction(reconstruction));
        }
        self.results
            .get(&self.keys.make_persistent_key(key))
            .map(Lookup::Reassembled)
    }

    /// Look up `key` in the fragment table only.
    #[must_use]
    pub fn reconstruction(&self, key: &KeyInput<'_>) -> Option<&Reconstruction> {
        self.keys
            .find_temp_key(key)
            .and_then(|temp| self.fragments.get(&temp))
    }

    /// Look up `key` in the result table only.
    #[must_use]
    pub fn get_reassembled(&self, key: &KeyInput<'_>) -> Option<Arc<Reassembled>> {
        self.results.get(&self.keys.make_persistent_key(key)).cloned()
    }

    /// Remove every entry for `key`, handing back the completed payload.
    ///
    /// Returns `None` when the identity is unknown or never completed.
    pub fn delete(&mut self, key: &KeyInput<'_>) -> Option<Bytes> {
        let in_progress = self
            .keys
            .find_temp_key(key)
            .and_then(|temp| self.fragments.remove(&temp));
        let cached = self.results.remove(&self.keys.make_persistent_key(key));
        let result = in_progress.and_then(Reconstruction::into_result).or(cached)?;
        debug!(
            "reassembly deleted: table={}, id={}, len={}",
            self.name,
            key.id,
            result.payload().len()
        );
        Some(Arc::try_unwrap(result).map_or_else(|shared| shared.bytes(), Reassembled::into_bytes))
    }
}

/// Log and count anomalies that appeared between `before` and `after`.
fn report_anomalies(table: &str, config: &ReassemblyConfig, key: &KeyInput<'_>, before: Anomalies, after: Anomalies) {
    for kind in after.added_since(before) {
        metrics::inc_anomalies(table, kind);
        if config.log_anomalies {
            warn!(
                "reassembly anomaly: table={table}, flow={}, id={}, kind={kind}",
                key.flow, key.id
            );
        } else {
            debug!(
                "reassembly anomaly: table={table}, flow={}, id={}, kind={kind}",
                key.flow, key.id
            );
        }
    }
}

#[cfg(test)]
mod tests;
