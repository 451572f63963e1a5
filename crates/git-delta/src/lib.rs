//! Delta stream parsing, application, and chain collapsing.
//!
//! Git packfiles store most objects as deltas against a base object. A
//! delta stream is a small program: a header declaring base and target
//! sizes, followed by copy instructions (take a range of the base) and
//! insert instructions (take literal bytes embedded in the stream).
//!
//! Deeply deltified objects are common in old packs. Reconstructing one by
//! materialising every intermediate buffer costs memory proportional to
//! chain length times object size; [`connect_deltas`] instead folds a whole
//! chain into a single equivalent delta against the ultimate base, rewriting
//! the top-level stream in place. [`apply_delta`] is the plain single-delta
//! application used for undeltified leaves and as a reference baseline.

pub mod apply;
pub mod chain;
pub mod index;
pub mod opcode;

pub use apply::{apply_delta, apply_delta_into};
pub use chain::{connect_deltas, CollapsedDelta};
pub use index::{DeltaIndex, DeltaInfo};
pub use opcode::Opcode;

/// Errors that can occur while parsing, applying, or collapsing deltas.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("invalid delta at offset {offset}: {reason}")]
    InvalidDelta { offset: u64, reason: String },

    #[error("delta stream too large: {0} bytes (limit is 4 GiB)")]
    OversizedDelta(u64),

    #[error("no delta streams provided")]
    NoStreams,

    #[error("failed to allocate {0} bytes")]
    AllocationFailure(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Largest stream we handle, before or after collapsing.
pub const MAX_DELTA_SIZE: u64 = 1 << 32;

/// A copy whose size bits are all zero on the wire copies this many bytes.
pub const COPY_SIZE_ZERO: u32 = 0x10000;

/// Longest literal run a single insert instruction can carry.
pub const MAX_INSERT_SIZE: usize = 0x7f;
