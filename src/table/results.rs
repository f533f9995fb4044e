//! Cache of completed messages keyed by persistent identity.
//!
//! Entries are shared [`Arc<Reassembled>`] values. An entry is never mutated
//! in place: truncation replaces it, so holders of the previous `Arc` keep the
//! bytes they were handed.

use std::{collections::HashMap, sync::Arc};

use crate::{
    fragment::{Discipline, ReassemblyError, Reassembled},
    key::PersistentKey,
};

/// Completed results, reused by every later lookup of the same identity.
#[derive(Debug, Default)]
pub struct ResultTable {
    entries: HashMap<PersistentKey, Arc<Reassembled>>,
}

impl ResultTable {
    /// Shared result for `key`.
    #[must_use]
    pub fn get(&self, key: &PersistentKey) -> Option<&Arc<Reassembled>> { self.entries.get(key) }

    /// Whether `key` has a completed result.
    #[must_use]
    pub fn contains(&self, key: &PersistentKey) -> bool { self.entries.contains_key(key) }

    /// Number of cached results.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Iterate over cached results in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&PersistentKey, &Arc<Reassembled>)> { self.entries.iter() }

    /// Cache `result` under `key` unless a result is already present.
    ///
    /// Returns the result that is cached afterwards.
    pub(crate) fn insert(&mut self, key: PersistentKey, result: Arc<Reassembled>) -> Arc<Reassembled> {
        Arc::clone(self.entries.entry(key).or_insert(result))
    }

    pub(crate) fn remove(&mut self, key: &PersistentKey) -> Option<Arc<Reassembled>> { self.entries.remove(key) }

    pub(crate) fn truncate(
        &mut self,
        key: &PersistentKey,
        new_total: u32,
    ) -> Result<Arc<Reassembled>, ReassemblyError> {
        let entry = self.entries.get_mut(key).ok_or(ReassemblyError::NotFound)?;
        let truncated = Arc::new(truncate_result(entry, new_total)?);
        *entry = Arc::clone(&truncated);
        Ok(truncated)
    }

    pub(crate) fn clear(&mut self) { self.entries.clear(); }
}

/// Copy of `result` cut down to `new_total` bytes.
fn truncate_result(result: &Reassembled, new_total: u32) -> Result<Reassembled, ReassemblyError> {
    if result.discipline != Discipline::ByteOffset {
        return Err(ReassemblyError::DisciplineMismatch {
            expected: result.discipline,
            found: Discipline::ByteOffset,
        });
    }
    if new_total > result.total {
        return Err(ReassemblyError::InvalidTruncation {
            current: result.total,
            requested: new_total,
        });
    }

    let fragments = result
        .fragments
        .iter()
        .filter(|summary| summary.position < new_total)
        .map(|summary| {
            let mut kept = *summary;
            kept.len = kept.len.min(new_total - kept.position);
            kept
        })
        .collect();
    Ok(Reassembled {
        discipline: result.discipline,
        data: result.data.slice(..new_total as usize),
        total: new_total,
        reassembled_in: result.reassembled_in,
        anomalies: result.anomalies,
        fragments,
    })
}
