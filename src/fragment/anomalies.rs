//! Advisory conditions recorded on fragments and reassemblies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One kind of recorded anomaly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    /// Fragments overlap with identical bytes.
    Overlap,
    /// Fragments overlap with differing bytes.
    OverlapConflict,
    /// More than one final fragment claims a different end.
    MultipleTails,
    /// A fragment reaches past the established end.
    TooLong,
}

impl AnomalyKind {
    /// Every kind, in reporting order.
    pub const ALL: [Self; 4] = [
        Self::Overlap,
        Self::OverlapConflict,
        Self::MultipleTails,
        Self::TooLong,
    ];

    /// Stable label used in logs, metrics and the fragment tree.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Overlap => "overlap",
            Self::OverlapConflict => "overlap-conflict",
            Self::MultipleTails => "multiple-tails",
            Self::TooLong => "too-long",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Set of anomalies observed while merging.
///
/// Flags only ever accumulate; none of them blocks reassembly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anomalies {
    /// Overlapping bytes were seen.
    pub overlap: bool,
    /// Overlapping bytes differed.
    pub overlap_conflict: bool,
    /// Final fragments disagreed about the end.
    pub multiple_tails: bool,
    /// Data reached past the end.
    pub too_long: bool,
}

impl Anomalies {
    /// No anomaly recorded.
    pub const NONE: Self = Self {
        overlap: false,
        overlap_conflict: false,
        multiple_tails: false,
        too_long: false,
    };

    /// Whether nothing was recorded.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !(self.overlap || self.overlap_conflict || self.multiple_tails || self.too_long)
    }

    /// Whether `kind` was recorded.
    #[must_use]
    pub const fn contains(self, kind: AnomalyKind) -> bool {
        match kind {
            AnomalyKind::Overlap => self.overlap,
            AnomalyKind::OverlapConflict => self.overlap_conflict,
            AnomalyKind::MultipleTails => self.multiple_tails,
            AnomalyKind::TooLong => self.too_long,
        }
    }

    /// Record `kind`.
    pub fn insert(&mut self, kind: AnomalyKind) {
        match kind {
            AnomalyKind::Overlap => self.overlap = true,
            AnomalyKind::OverlapConflict => self.overlap_conflict = true,
            AnomalyKind::MultipleTails => self.multiple_tails = true,
            AnomalyKind::TooLong => self.too_long = true,
        }
    }

    /// Union of both sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            overlap: self.overlap || other.overlap,
            overlap_conflict: self.overlap_conflict || other.overlap_conflict,
            multiple_tails: self.multiple_tails || other.multiple_tails,
            too_long: self.too_long || other.too_long,
        }
    }

    /// Kinds present in `self` but not in `before`.
    pub fn added_since(self, before: Self) -> impl Iterator<Item = AnomalyKind> {
        AnomalyKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind) && !before.contains(*kind))
    }

    /// Recorded kinds in reporting order.
    pub fn iter(self) -> impl Iterator<Item = AnomalyKind> {
        AnomalyKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl fmt::Display for Anomalies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        for (i, kind) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(kind.as_str())?;
        }
        Ok(())
    }
}

impl FromIterator<AnomalyKind> for Anomalies {
    fn from_iter<T: IntoIterator<Item = AnomalyKind>>(iter: T) -> Self {
        let mut set = Self::NONE;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}
