//! Offset index over a single delta stream.
//!
//! A [`DeltaIndex`] records, for every instruction of a stream, where that
//! instruction starts in the stream and where its output starts in the
//! target. That is enough to answer "which instructions reproduce target
//! range `[ofs, ofs+size)`" in O(log n + instructions touched), which is
//! the primitive the chain collapser is built on: a copy in a shallower
//! delta names a range of *this* stream's target, and [`emit_slice`]
//! re-expresses that range as instructions against this stream's own base.
//!
//! [`emit_slice`]: DeltaIndex::emit_slice

use crate::opcode::{read_header, Opcode};
use crate::{DeltaError, MAX_DELTA_SIZE};

/// Additive reserve floor for the entry vector. Indexes are rebuilt for
/// every link of a chain; small deltas must not pay a realloc per link.
const ENTRY_GROW_BY: usize = 100;

/// One instruction of an indexed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaInfo {
    /// Byte offset in the delta stream where the instruction begins.
    pub stream_ofs: u32,
    /// Target offset at which the instruction's output begins.
    pub target_ofs: u32,
}

/// Sorted instruction table over one delta stream.
///
/// Borrows the stream bytes; entries are strictly increasing in both
/// `stream_ofs` and `target_ofs`, and the first entry (if any) starts at
/// target offset zero.
pub struct DeltaIndex<'a> {
    stream: &'a [u8],
    /// Offset just past the two header varints.
    body: usize,
    base_size: u64,
    target_size: u64,
    entries: Vec<DeltaInfo>,
    /// Output size of the last instruction; every other instruction's size
    /// is the gap to the next entry.
    tail_size: u32,
}

fn reserve_entries(entries: &mut Vec<DeltaInfo>, needed: usize) -> Result<(), DeltaError> {
    if needed <= entries.capacity() {
        return Ok(());
    }
    let mut want = needed;
    if needed - entries.capacity() < 10 {
        want += ENTRY_GROW_BY;
    }
    entries
        .try_reserve_exact(want)
        .map_err(|_| DeltaError::AllocationFailure(want * std::mem::size_of::<DeltaInfo>()))
}

impl<'a> DeltaIndex<'a> {
    /// Build an index over `stream`, validating it completely.
    pub fn parse(stream: &'a [u8]) -> Result<Self, DeltaError> {
        Self::parse_with(stream, Vec::new())
    }

    /// Like [`parse`](Self::parse), but reuses a previously allocated entry
    /// vector (cleared; capacity kept). Pair with
    /// [`into_entries`](Self::into_entries) when indexing many streams in a
    /// row.
    pub fn parse_with(stream: &'a [u8], mut entries: Vec<DeltaInfo>) -> Result<Self, DeltaError> {
        entries.clear();

        if stream.len() as u64 > MAX_DELTA_SIZE {
            return Err(DeltaError::OversizedDelta(stream.len() as u64));
        }
        let (base_size, target_size, body) = read_header(stream)?;

        // First scan: count instructions so the entry vector is sized once.
        let mut count = 0usize;
        let mut pos = body;
        while pos < stream.len() {
            let (_, next) = Opcode::parse(stream, pos)?;
            count += 1;
            pos = next;
        }
        reserve_entries(&mut entries, count)?;

        // Second scan: record entries and validate output bounds.
        let mut pos = body;
        let mut target_ofs: u64 = 0;
        let mut tail_size = 0u32;
        while pos < stream.len() {
            if target_ofs >= target_size {
                return Err(DeltaError::InvalidDelta {
                    offset: pos as u64,
                    reason: format!(
                        "instructions exceed declared target size {target_size}"
                    ),
                });
            }
            let (op, next) = Opcode::parse(stream, pos)?;
            if let Opcode::Copy { offset, size } = op {
                if offset as u64 + size as u64 > base_size {
                    return Err(DeltaError::InvalidDelta {
                        offset: pos as u64,
                        reason: format!(
                            "copy out of base range: offset={offset}, size={size}, base_size={base_size}"
                        ),
                    });
                }
            }
            entries.push(DeltaInfo {
                stream_ofs: pos as u32,
                target_ofs: target_ofs as u32,
            });
            tail_size = op.output_size();
            target_ofs += tail_size as u64;
            pos = next;
        }

        if target_ofs != target_size {
            return Err(DeltaError::InvalidDelta {
                offset: 0,
                reason: format!(
                    "target size mismatch: declared {target_size}, instructions produce {target_ofs}"
                ),
            });
        }

        Ok(DeltaIndex {
            stream,
            body,
            base_size,
            target_size,
            entries,
            tail_size,
        })
    }

    /// Recover the entry vector for reuse with [`parse_with`](Self::parse_with).
    pub fn into_entries(self) -> Vec<DeltaInfo> {
        self.entries
    }

    /// Declared size of the base this stream reads from.
    pub fn base_size(&self) -> u64 {
        self.base_size
    }

    /// Declared size of the target this stream produces.
    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    /// Number of instructions in the stream.
    pub fn num_ops(&self) -> usize {
        self.entries.len()
    }

    /// Offset of the instruction body within the stream.
    pub fn body_start(&self) -> usize {
        self.body
    }

    /// Output size of entry `i`.
    fn entry_size(&self, i: usize) -> u32 {
        if i + 1 == self.entries.len() {
            self.tail_size
        } else {
            self.entries[i + 1].target_ofs - self.entries[i].target_ofs
        }
    }

    /// Find the entry whose output covers `target_ofs`.
    ///
    /// Returns the entry's index and the offset of `target_ofs` within its
    /// output. `target_ofs == target_size` resolves to the last entry with
    /// a relative offset equal to its full output size. The index must be
    /// non-empty and `target_ofs` in range.
    pub fn locate(&self, target_ofs: u64) -> (usize, u32) {
        debug_assert!(!self.entries.is_empty());
        debug_assert!(target_ofs <= self.target_size);

        let mut low = 0usize;
        let mut high = self.entries.len();
        while low < high {
            let mid = low + (high - low) / 2;
            if (self.entries[mid].target_ofs as u64) <= target_ofs {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        let i = low - 1;
        (i, (target_ofs - self.entries[i].target_ofs as u64) as u32)
    }

    /// Instructions reproducing `size` bytes of this stream's target
    /// starting at `ofs`: a possibly partial head, whole middle entries,
    /// and a possibly partial tail.
    fn slice_ops(&self, ofs: u64, size: u32) -> impl Iterator<Item = Opcode<'a>> + '_ {
        debug_assert!(ofs + size as u64 <= self.target_size);
        let (mut entry, mut rel) = self.locate(ofs);
        let mut remaining = size;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let (op, _) = Opcode::parse(self.stream, self.entries[entry].stream_ofs as usize)
                .expect("instruction validated during index construction");
            let avail = self.entry_size(entry) - rel;
            let take = avail.min(remaining);
            let piece = op.slice(rel, take);
            rel = 0;
            entry += 1;
            remaining -= take;
            Some(piece)
        })
    }

    /// Encoded size, in bytes, of the instruction sequence
    /// [`emit_slice`](Self::emit_slice) would produce for the same range.
    pub fn slice_encoded_size(&self, ofs: u32, size: u32) -> usize {
        self.slice_ops(ofs as u64, size).map(|op| op.encoded_size()).sum()
    }

    /// Emit the instruction sequence for target range `[ofs, ofs+size)` at
    /// the front of `out`.
    ///
    /// Returns `(bytes_written, instructions_written)`; the byte count
    /// always equals [`slice_encoded_size`](Self::slice_encoded_size) for
    /// the same range.
    pub fn emit_slice(&self, out: &mut [u8], ofs: u32, size: u32) -> (usize, usize) {
        let mut pos = 0;
        let mut chunks = 0;
        for op in self.slice_ops(ofs as u64, size) {
            pos += op.emit_into(&mut out[pos..]);
            chunks += 1;
        }
        (pos, chunks)
    }

    /// Append the instruction sequence for target range `[ofs, ofs+size)`
    /// to `out`. Returns the number of instructions written.
    pub fn emit_slice_vec(&self, out: &mut Vec<u8>, ofs: u32, size: u32) -> usize {
        let mut chunks = 0;
        for op in self.slice_ops(ofs as u64, size) {
            op.emit(out);
            chunks += 1;
        }
        chunks
    }
}
