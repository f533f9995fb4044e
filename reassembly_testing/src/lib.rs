//! Fixtures and builders for testing `reassembly` tables.
//!
//! ```rust
//! use reassembly::{KeyInput, MessageId};
//! use reassembly_testing::{add_all, completions, flow, split_bytes, table};
//!
//! let mut table = table();
//! let flow = flow();
//! let key = KeyInput::new(&flow, MessageId::new(1));
//! let mut fragments = split_bytes(b"HELLOWORLD", 3);
//! fragments.reverse();
//!
//! let done = completions(add_all(&mut table, &key, &fragments));
//! assert_eq!(done[0].payload(), b"HELLOWORLD");
//! ```

pub mod helpers;
pub mod logging;
pub mod metrics;

pub use helpers::{
    OwnedFragment,
    add_all,
    add_seq_all,
    completions,
    flow,
    split_blocks,
    split_bytes,
    table,
};
pub use logging::{LoggerHandle, logger};
pub use metrics::{counter_value, recorder};
