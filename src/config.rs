//! Configuration for reassembly tables.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::{arena::DEFAULT_CHUNK_SIZE, key::KeyScheme};

/// Per-table reassembly settings.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroUsize;
///
/// use reassembly::{KeyScheme, ReassemblyConfig};
///
/// let config = ReassemblyConfig::default()
///     .key_scheme(KeyScheme::Addresses)
///     .tolerate_multiple_tails(false)
///     .max_message_size(NonZeroUsize::new(65_535));
///
/// assert!(!config.tolerate_multiple_tails);
/// assert_eq!(config.key_scheme, KeyScheme::Addresses);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Flow fields that take part in identity keys.
    ///
    /// Default: [`KeyScheme::AddressesPorts`].
    pub key_scheme: KeyScheme,

    /// Whether a second, different final fragment is only flagged.
    ///
    /// When false the conflicting tail is an unreconcilable length and the
    /// reassembly enters its error state.
    ///
    /// Default: true.
    pub tolerate_multiple_tails: bool,

    /// Upper bound on the byte length of a reassembled message.
    ///
    /// Default: unbounded.
    pub max_message_size: Option<NonZeroUsize>,

    /// Upper bound on the fragments held for one message.
    ///
    /// Default: unbounded.
    pub max_fragments: Option<NonZeroUsize>,

    /// Size of each chunk the session arena reserves.
    ///
    /// Default: 64 KiB.
    pub arena_chunk_size: NonZeroUsize,

    /// Ceiling on bytes held by the session arena.
    ///
    /// Default: unbounded.
    pub arena_limit: Option<NonZeroUsize>,

    /// Whether anomalies are logged at warn level rather than debug.
    ///
    /// Default: true.
    pub log_anomalies: bool,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            key_scheme: KeyScheme::default(),
            tolerate_multiple_tails: true,
            max_message_size: None,
            max_fragments: None,
            arena_chunk_size: NonZeroUsize::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroUsize::MIN),
            arena_limit: None,
            log_anomalies: true,
        }
    }
}

impl ReassemblyConfig {
    /// Set the identity key scheme.
    #[must_use]
    pub fn key_scheme(mut self, scheme: KeyScheme) -> Self {
        self.key_scheme = scheme;
        self
    }

    /// Set whether conflicting final fragments are tolerated.
    #[must_use]
    pub fn tolerate_multiple_tails(mut self, enabled: bool) -> Self {
        self.tolerate_multiple_tails = enabled;
        self
    }

    /// Set the maximum reassembled message size.
    #[must_use]
    pub fn max_message_size(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Set the maximum number of fragments per message.
    #[must_use]
    pub fn max_fragments(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.max_fragments = limit;
        self
    }

    /// Set the session arena chunk size.
    #[must_use]
    pub fn arena_chunk_size(mut self, size: NonZeroUsize) -> Self {
        self.arena_chunk_size = size;
        self
    }

    /// Set the session arena ceiling.
    #[must_use]
    pub fn arena_limit(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.arena_limit = limit;
        self
    }

    /// Set whether anomalies log at warn level.
    #[must_use]
    pub fn log_anomalies(mut self, enabled: bool) -> Self {
        self.log_anomalies = enabled;
        self
    }
}
