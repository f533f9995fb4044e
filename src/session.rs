//! Registry of named reassembly tables for one analysis session.
//!
//! `SessionContext` owns every [`ReassemblyTable`] a host registers, keyed by
//! table name, and fans the session-wide lifecycle events out to them: the end
//! of each packet and the start of a new capture. Tables sit behind a
//! [`DashMap`], so lookups from different dissectors only contend on the shard
//! holding the table they touch.

use dashmap::{
    DashMap,
    mapref::one::{Ref, RefMut},
};
use log::debug;

use crate::{config::ReassemblyConfig, table::ReassemblyTable};

/// Named reassembly tables sharing one session lifecycle.
#[derive(Debug, Default)]
pub struct SessionContext {
    tables: DashMap<String, ReassemblyTable>,
}

impl SessionContext {
    /// Create a session with no tables.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register a table under `name`.
    ///
    /// Registering an existing name re-initialises that table with `config`,
    /// discarding its state.
    pub fn register(&self, name: &str, config: ReassemblyConfig) {
        let replaced = self
            .tables
            .insert(name.to_owned(), ReassemblyTable::new(name, config))
            .is_some();
        debug!("reassembly table registered: table={name}, replaced={replaced}");
    }

    /// Destroy the table named `name`, returning it if it was registered.
    ///
    /// Results already handed out stay readable through their `Arc`s.
    pub fn unregister(&self, name: &str) -> Option<ReassemblyTable> {
        let (_, table) = self.tables.remove(name)?;
        debug!(
            "reassembly table destroyed: table={name}, in_progress={}",
            table.in_progress()
        );
        Some(table)
    }

    /// Shared access to the table named `name`.
    ///
    /// The guard holds a shard read lock; drop it before registering tables.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<Ref<'_, String, ReassemblyTable>> { self.tables.get(name) }

    /// Exclusive access to the table named `name`.
    #[must_use]
    pub fn table_mut(&self, name: &str) -> Option<RefMut<'_, String, ReassemblyTable>> { self.tables.get_mut(name) }

    /// Run `f` against the table named `name`.
    pub fn with_table<R>(&self, name: &str, f: impl FnOnce(&mut ReassemblyTable) -> R) -> Option<R> {
        self.tables.get_mut(name).map(|mut table| f(table.value_mut()))
    }

    /// Names of the registered tables, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|entry| entry.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tables.
    #[must_use]
    pub fn len(&self) -> usize { self.tables.len() }

    /// Whether no table is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.tables.is_empty() }

    /// Release every table's per-packet scratch space.
    pub fn end_packet(&self) {
        for mut table in self.tables.iter_mut() {
            table.end_packet();
        }
    }

    /// Start a new capture: every table drops its state and session arena.
    pub fn reset(&mut self) {
        for mut table in self.tables.iter_mut() {
            table.init();
        }
        debug!("reassembly session reset: tables={}", self.tables.len());
    }
}
