//! Two-scope bump arena backing reassembly state.
//!
//! [`Arena`] hands out [`Block`] handles from one of two regions: a
//! per-packet scope that is released after each processed unit of work, and a
//! per-session scope that lives until the capture is discarded. Blocks are
//! never freed individually. Resetting a scope bumps its generation, so every
//! handle issued before the reset stops resolving at once.

use std::{fmt, num::NonZeroUsize};

use thiserror::Error;

/// Default size of a freshly allocated arena chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Lifetime class of an arena allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Released after the current packet has been processed.
    Packet,
    /// Released only when the capture session is reset.
    Session,
}

impl Scope {
    const fn as_str(self) -> &'static str {
        match self {
            Scope::Packet => "packet",
            Scope::Session => "session",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Errors raised by [`Arena`] allocation and lookup.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    /// The configured ceiling for the scope would be exceeded.
    #[error("{scope} arena exhausted: {requested} bytes requested with {in_use} in use (limit {limit})")]
    Exhausted {
        /// Scope that ran out of room.
        scope: Scope,
        /// Size of the failed request.
        requested: usize,
        /// Bytes already handed out from the scope.
        in_use: usize,
        /// Configured ceiling.
        limit: NonZeroUsize,
    },
    /// The allocator could not reserve a new chunk.
    #[error("{scope} arena could not reserve {requested} bytes")]
    AllocationFailed {
        /// Scope that requested the chunk.
        scope: Scope,
        /// Size of the failed request.
        requested: usize,
    },
    /// A handle outlived the scope generation that issued it.
    #[error("stale {scope} block from generation {generation}")]
    StaleBlock {
        /// Scope of the stale handle.
        scope: Scope,
        /// Generation recorded in the handle.
        generation: u64,
    },
}

/// Handle to bytes owned by an [`Arena`].
///
/// A block is only meaningful to the arena that produced it and only until
/// its scope is reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    scope: Scope,
    generation: u64,
    chunk: usize,
    offset: usize,
    len: usize,
}

impl Block {
    /// Scope the block was allocated from.
    #[must_use]
    pub const fn scope(&self) -> Scope { self.scope }

    /// Generation of the scope at allocation time.
    #[must_use]
    pub const fn generation(&self) -> u64 { self.generation }

    /// Number of bytes addressed by the block.
    #[must_use]
    pub const fn len(&self) -> usize { self.len }

    /// Whether the block addresses no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool { self.len == 0 }

    /// Narrow the block to at most its first `len` bytes.
    #[must_use]
    pub fn truncated(self, len: usize) -> Self {
        Self {
            len: self.len.min(len),
            ..self
        }
    }
}

#[derive(Debug)]
struct Region {
    scope: Scope,
    generation: u64,
    chunk_size: NonZeroUsize,
    limit: Option<NonZeroUsize>,
    chunks: Vec<Vec<u8>>,
    in_use: usize,
}

impl Region {
    fn new(scope: Scope, chunk_size: NonZeroUsize, limit: Option<NonZeroUsize>) -> Self {
        Self {
            scope,
            generation: 0,
            chunk_size,
            limit,
            chunks: Vec::new(),
            in_use: 0,
        }
    }

    /// Find or create a chunk with room for `len` more bytes.
    fn reserve(&mut self, len: usize) -> Result<usize, ArenaError> {
        if let Some(limit) = self.limit
            && self.in_use.saturating_add(len) > limit.get()
        {
            return Err(ArenaError::Exhausted {
                scope: self.scope,
                requested: len,
                in_use: self.in_use,
                limit,
            });
        }

        if let Some(last) = self.chunks.last()
            && last.capacity() - last.len() >= len
        {
            return Ok(self.chunks.len() - 1);
        }

        let capacity = len.max(self.chunk_size.get());
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(capacity)
            .map_err(|_| ArenaError::AllocationFailed {
                scope: self.scope,
                requested: capacity,
            })?;
        self.chunks.push(chunk);
        Ok(self.chunks.len() - 1)
    }

    fn alloc_with(
        &mut self,
        len: usize,
        fill: impl FnOnce(&mut Vec<u8>),
    ) -> Result<Block, ArenaError> {
        let chunk = self.reserve(len)?;
        let buffer = &mut self.chunks[chunk];
        let offset = buffer.len();
        fill(buffer);
        debug_assert_eq!(buffer.len(), offset + len);
        self.in_use += len;
        Ok(Block {
            scope: self.scope,
            generation: self.generation,
            chunk,
            offset,
            len,
        })
    }

    fn get(&self, block: &Block) -> Option<&[u8]> {
        if block.scope != self.scope || block.generation != self.generation {
            return None;
        }
        if block.len == 0 {
            return Some(&[]);
        }
        self.chunks
            .get(block.chunk)?
            .get(block.offset..block.offset + block.len)
    }

    fn get_mut(&mut self, block: &Block) -> Option<&mut [u8]> {
        if block.scope != self.scope || block.generation != self.generation {
            return None;
        }
        if block.len == 0 {
            return Some(&mut []);
        }
        self.chunks
            .get_mut(block.chunk)?
            .get_mut(block.offset..block.offset + block.len)
    }

    fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.chunks.clear();
        self.in_use = 0;
    }
}

/// Bump allocator with a packet scope nested inside a session scope.
///
/// # Examples
///
/// ```
/// use reassembly::arena::{Arena, Scope};
///
/// let mut arena = Arena::default();
/// let block = arena.alloc(Scope::Session, b"hello").expect("allocate");
/// assert_eq!(arena.get(&block), Some(&b"hello"[..]));
///
/// arena.reset(Scope::Session);
/// assert_eq!(arena.get(&block), None);
/// ```
#[derive(Debug)]
pub struct Arena {
    packet: Region,
    session: Region,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroUsize::MIN),
            None,
        )
    }
}

impl Arena {
    /// Create an arena whose session scope is optionally capped at `session_limit` bytes.
    #[must_use]
    pub fn new(chunk_size: NonZeroUsize, session_limit: Option<NonZeroUsize>) -> Self {
        Self {
            packet: Region::new(Scope::Packet, chunk_size, None),
            session: Region::new(Scope::Session, chunk_size, session_limit),
        }
    }

    fn region(&self, scope: Scope) -> &Region {
        match scope {
            Scope::Packet => &self.packet,
            Scope::Session => &self.session,
        }
    }

    fn region_mut(&mut self, scope: Scope) -> &mut Region {
        match scope {
            Scope::Packet => &mut self.packet,
            Scope::Session => &mut self.session,
        }
    }

    /// Copy `bytes` into `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::Exhausted`] when the scope ceiling would be
    /// exceeded and [`ArenaError::AllocationFailed`] when memory cannot be
    /// reserved.
    pub fn alloc(&mut self, scope: Scope, bytes: &[u8]) -> Result<Block, ArenaError> {
        self.region_mut(scope)
            .alloc_with(bytes.len(), |buf| buf.extend_from_slice(bytes))
    }

    /// Allocate `len` zeroed bytes in `scope`.
    ///
    /// # Errors
    ///
    /// See [`alloc`](Self::alloc).
    pub fn alloc_zeroed(&mut self, scope: Scope, len: usize) -> Result<Block, ArenaError> {
        self.region_mut(scope).alloc_with(len, |buf| {
            let new_len = buf.len() + len;
            buf.resize(new_len, 0);
        })
    }

    /// Resolve a block, returning `None` once its scope has been reset.
    #[must_use]
    pub fn get(&self, block: &Block) -> Option<&[u8]> { self.region(block.scope).get(block) }

    /// Resolve a block mutably.
    pub fn get_mut(&mut self, block: &Block) -> Option<&mut [u8]> {
        self.region_mut(block.scope).get_mut(block)
    }

    /// Resolve a block or report it as stale.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::StaleBlock`] when the scope was reset after the
    /// block was issued.
    pub fn resolve(&self, block: &Block) -> Result<&[u8], ArenaError> {
        self.get(block).ok_or(ArenaError::StaleBlock {
            scope: block.scope,
            generation: block.generation,
        })
    }

    /// Bytes handed out from `scope` since its last reset.
    #[must_use]
    pub fn in_use(&self, scope: Scope) -> usize { self.region(scope).in_use }

    /// Current generation of `scope`.
    #[must_use]
    pub fn generation(&self, scope: Scope) -> u64 { self.region(scope).generation }

    /// Release every block of `scope`.
    ///
    /// Resetting the session scope also resets the packet scope nested in it.
    pub fn reset(&mut self, scope: Scope) {
        self.packet.reset();
        if scope == Scope::Session {
            self.session.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use rstest::rstest;

    use super::{Arena, ArenaError, Scope};

    fn small_arena(limit: Option<usize>) -> Arena {
        Arena::new(
            NonZeroUsize::new(8).expect("non-zero"),
            limit.and_then(NonZeroUsize::new),
        )
    }

    #[test]
    fn blocks_resolve_to_their_bytes_across_chunks() {
        let mut arena = small_arena(None);
        let first = arena.alloc(Scope::Session, b"abcdef").expect("first");
        let second = arena.alloc(Scope::Session, b"ghijkl").expect("second");
        let large = arena.alloc(Scope::Session, &[7_u8; 20]).expect("large");

        assert_eq!(arena.get(&first), Some(&b"abcdef"[..]));
        assert_eq!(arena.get(&second), Some(&b"ghijkl"[..]));
        assert_eq!(arena.get(&large).map(<[u8]>::len), Some(20));
        assert_eq!(arena.in_use(Scope::Session), 32);
    }

    #[test]
    fn zeroed_blocks_are_writable() {
        let mut arena = small_arena(None);
        let block = arena.alloc_zeroed(Scope::Packet, 4).expect("zeroed");
        assert_eq!(arena.get(&block), Some(&[0_u8; 4][..]));

        arena
            .get_mut(&block)
            .expect("live block")
            .copy_from_slice(b"wxyz");
        assert_eq!(arena.get(&block), Some(&b"wxyz"[..]));
    }

    #[rstest]
    #[case(Scope::Packet, false)]
    #[case(Scope::Session, true)]
    fn reset_invalidates_scope(#[case] reset: Scope, #[case] session_cleared: bool) {
        let mut arena = small_arena(None);
        let packet = arena.alloc(Scope::Packet, b"pkt").expect("packet");
        let session = arena.alloc(Scope::Session, b"ses").expect("session");

        arena.reset(reset);

        assert_eq!(arena.get(&packet), None);
        assert_eq!(arena.get(&session).is_none(), session_cleared);
        assert_eq!(
            arena.resolve(&packet),
            Err(ArenaError::StaleBlock {
                scope: Scope::Packet,
                generation: 0,
            })
        );
    }

    #[test]
    fn session_limit_is_enforced() {
        let mut arena = small_arena(Some(10));
        arena.alloc(Scope::Session, &[1_u8; 6]).expect("within limit");

        let err = arena
            .alloc(Scope::Session, &[2_u8; 6])
            .expect_err("limit exceeded");
        assert!(matches!(
            err,
            ArenaError::Exhausted {
                scope: Scope::Session,
                requested: 6,
                in_use: 6,
                ..
            }
        ));

        // The packet scope is not capped.
        arena.alloc(Scope::Packet, &[3_u8; 64]).expect("packet scope");
    }

    #[test]
    fn empty_and_truncated_blocks() {
        let mut arena = small_arena(None);
        let empty = arena.alloc(Scope::Session, &[]).expect("empty");
        assert!(empty.is_empty());
        assert_eq!(arena.get(&empty), Some(&[][..]));

        let block = arena.alloc(Scope::Session, b"truncate").expect("block");
        assert_eq!(arena.get(&block.truncated(5)), Some(&b"trunc"[..]));
        assert_eq!(arena.get(&block.truncated(99)), Some(&b"truncate"[..]));
    }
}
