//! Delta chain collapsing.
//!
//! A deltified object is stored as a chain: the topmost delta produces the
//! object, its base is the target of the next delta, and so on down to an
//! undeltified base object. Naive reconstruction materialises every
//! intermediate target. [`connect_deltas`] avoids that: it keeps only the
//! topmost stream and, for each deeper delta, rewrites every copy in the
//! topmost stream into the instruction sequence that reproduces the same
//! bytes from the deeper base. After the last link the topmost stream is a
//! single delta against the ultimate base; peak memory is bounded by the
//! collapsed stream itself, not by the object.
//!
//! Each rewrite runs in place over the topmost stream: a forward planning
//! pass computes the byte shift of every instruction, the buffer grows
//! once, and a back-to-front sweep moves inserts and expands copies. The
//! sweep is ordered back-to-front because copies usually expand; later
//! instructions move right first, so earlier bytes are still unread when
//! their turn comes.

use std::borrow::Cow;
use std::io::Write;

use crate::index::{DeltaIndex, DeltaInfo};
use crate::opcode::{read_header, write_varint, Opcode};
use crate::{DeltaError, MAX_DELTA_SIZE};

/// Byte position of one instruction of the topmost stream and the shift
/// its rewrite applies to it. One sentinel entry past the last instruction
/// carries the total growth.
struct OpShift {
    /// Instruction start, relative to the stream buffer.
    pos: usize,
    /// Cumulative byte shift of all preceding rewrites.
    shift: i64,
}

/// A delta chain folded into a single stream against the ultimate base.
///
/// Produced by [`connect_deltas`]. For a single-element chain the input
/// buffer is borrowed as-is; the first composition step copies it into an
/// owned, growable buffer.
pub struct CollapsedDelta<'a> {
    stream: Cow<'a, [u8]>,
    /// Offset just past the two header varints.
    body: usize,
    base_size: u64,
    target_size: u64,
    /// Instruction count. Zero until the first composition step; chains of
    /// length one are adopted without scanning the body.
    num_chunks: usize,
}

impl<'a> CollapsedDelta<'a> {
    /// Size of the target buffer this delta reconstructs.
    pub fn rbound(&self) -> u64 {
        self.target_size
    }

    /// Declared size of the ultimate base this delta reads from.
    pub fn base_size(&self) -> u64 {
        self.base_size
    }

    /// Number of instructions in the collapsed stream. Zero for chains of
    /// length one, whose body is never scanned.
    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    /// The collapsed stream: header varints followed by the instruction
    /// body. A well-formed delta in its own right; applying it with
    /// [`apply_delta`](crate::apply_delta) against the ultimate base equals
    /// [`apply`](Self::apply).
    pub fn data(&self) -> &[u8] {
        &self.stream
    }

    /// Reconstruct the target by streaming copies of `base` and literal
    /// inserts into `writer`.
    pub fn apply<W: Write>(&self, base: &[u8], writer: &mut W) -> Result<(), DeltaError> {
        if base.len() as u64 != self.base_size {
            return Err(DeltaError::InvalidDelta {
                offset: 0,
                reason: format!(
                    "base size mismatch: delta says {}, base is {}",
                    self.base_size,
                    base.len()
                ),
            });
        }

        let stream: &[u8] = &self.stream;
        let mut pos = self.body;
        let mut written: u64 = 0;
        while pos < stream.len() {
            let (op, next) = Opcode::parse(stream, pos)?;
            match op {
                Opcode::Copy { offset, size } => {
                    let start = offset as usize;
                    let end = start + size as usize;
                    if end > base.len() {
                        return Err(DeltaError::InvalidDelta {
                            offset: pos as u64,
                            reason: format!(
                                "copy out of bounds: offset={offset}, size={size}, base_len={}",
                                base.len()
                            ),
                        });
                    }
                    writer.write_all(&base[start..end])?;
                }
                Opcode::Insert(data) => writer.write_all(data)?,
            }
            written += op.output_size() as u64;
            pos = next;
        }

        if written != self.target_size {
            return Err(DeltaError::InvalidDelta {
                offset: 0,
                reason: format!(
                    "target size mismatch: delta says {}, got {written}",
                    self.target_size
                ),
            });
        }

        Ok(())
    }

    /// Convenience wrapper around [`apply`](Self::apply) collecting into a
    /// fresh buffer.
    pub fn apply_to_vec(&self, base: &[u8]) -> Result<Vec<u8>, DeltaError> {
        let mut out = Vec::new();
        out.try_reserve_exact(self.target_size as usize)
            .map_err(|_| DeltaError::AllocationFailure(self.target_size as usize))?;
        self.apply(base, &mut out)?;
        Ok(out)
    }

    /// Copy a still-borrowed stream into an owned buffer and count its
    /// instructions. Runs exactly once, before the first composition.
    fn materialize(&mut self) -> Result<(), DeltaError> {
        if let Cow::Borrowed(bytes) = self.stream {
            let mut owned = Vec::new();
            owned
                .try_reserve_exact(bytes.len())
                .map_err(|_| DeltaError::AllocationFailure(bytes.len()))?;
            owned.extend_from_slice(bytes);
            self.stream = Cow::Owned(owned);
        }

        let stream: &[u8] = &self.stream;
        let mut count = 0usize;
        let mut pos = self.body;
        while pos < stream.len() {
            let (_, next) = Opcode::parse(stream, pos)?;
            count += 1;
            pos = next;
        }
        self.num_chunks = count;
        Ok(())
    }

    /// Rewrite this stream so that every copy reads from `idx`'s base
    /// instead of `idx`'s target.
    ///
    /// Inserts carry over verbatim; a copy of target range `[o, o+s)` of
    /// `idx` is replaced by the instruction slice reproducing that range.
    /// `shifts` is scratch storage, cleared on entry.
    fn rebase_onto(
        &mut self,
        idx: &DeltaIndex<'_>,
        shifts: &mut Vec<OpShift>,
    ) -> Result<(), DeltaError> {
        // Planning pass, front to back: per-instruction byte shifts and the
        // lowest intermediate shift.
        shifts.clear();
        let stream: &[u8] = &self.stream;
        let old_len = stream.len();
        let mut pos = self.body;
        let mut shift: i64 = 0;
        let mut min_shift: i64 = 0;
        while pos < old_len {
            shifts.push(OpShift { pos, shift });
            let (op, next) = Opcode::parse(stream, pos)?;
            if let Opcode::Copy { offset, size } = op {
                if offset as u64 + size as u64 > idx.target_size() {
                    return Err(DeltaError::InvalidDelta {
                        offset: pos as u64,
                        reason: format!(
                            "copy out of base range: offset={offset}, size={size}, base_size={}",
                            idx.target_size()
                        ),
                    });
                }
                let new_size = idx.slice_encoded_size(offset, size);
                shift += new_size as i64 - (next - pos) as i64;
                min_shift = min_shift.min(shift);
            }
            pos = next;
        }
        shifts.push(OpShift { pos, shift });

        let growth = shift;
        let new_len = (old_len as i64 + growth) as u64;
        if new_len > MAX_DELTA_SIZE {
            return Err(DeltaError::OversizedDelta(new_len));
        }

        let num_ops = shifts.len() - 1;
        let body = self.body;
        let buf = self.stream.to_mut();

        if min_shift >= 0 {
            // Hot path: nothing slides left. Grow once, then rewrite back to
            // front; every instruction lands at or beyond its old position,
            // so unprocessed earlier bytes are never overwritten.
            if growth > 0 {
                buf.try_reserve_exact(growth as usize)
                    .map_err(|_| DeltaError::AllocationFailure(growth as usize))?;
                buf.resize(old_len + growth as usize, 0);
            }

            let mut added_chunks = 0usize;
            for i in (0..num_ops).rev() {
                let pos = shifts[i].pos;
                let old_size = shifts[i + 1].pos - pos;
                let new_pos = pos + shifts[i].shift as usize;
                let new_size = (old_size as i64 + (shifts[i + 1].shift - shifts[i].shift)) as usize;

                let copy_params = match Opcode::parse(buf, pos)?.0 {
                    Opcode::Copy { offset, size } => Some((offset, size)),
                    Opcode::Insert(_) => None,
                };
                match copy_params {
                    Some((offset, size)) => {
                        let (written, chunks) =
                            idx.emit_slice(&mut buf[new_pos..new_pos + new_size], offset, size);
                        debug_assert_eq!(written, new_size);
                        added_chunks += chunks - 1;
                    }
                    None => {
                        if new_pos != pos {
                            buf.copy_within(pos..pos + old_size, new_pos);
                        }
                    }
                }
            }
            self.num_chunks += added_chunks;
        } else {
            // A replacement re-encoded smaller than the copy it replaces and
            // part of the body would slide left, which the in-place sweep
            // cannot do without clobbering unread bytes. Rebuild the body
            // into a fresh buffer instead.
            let mut rebuilt = Vec::new();
            rebuilt
                .try_reserve_exact(new_len as usize)
                .map_err(|_| DeltaError::AllocationFailure(new_len as usize))?;
            rebuilt.extend_from_slice(&buf[..body]);

            let mut num_chunks = 0usize;
            let mut pos = body;
            while pos < old_len {
                let (op, next) = Opcode::parse(buf, pos)?;
                match op {
                    Opcode::Copy { offset, size } => {
                        num_chunks += idx.emit_slice_vec(&mut rebuilt, offset, size);
                    }
                    Opcode::Insert(_) => {
                        rebuilt.extend_from_slice(&buf[pos..next]);
                        num_chunks += 1;
                    }
                }
                pos = next;
            }
            debug_assert_eq!(rebuilt.len() as u64, new_len);
            *buf = rebuilt;
            self.num_chunks = num_chunks;
        }

        Ok(())
    }

    /// Rewrite the header varints to the current base and target sizes.
    ///
    /// Composition leaves the topmost delta's original header in the
    /// buffer; its base size is stale once copies reference a deeper base.
    /// Runs after the last composition so [`data`](Self::data) is a
    /// well-formed stream.
    fn rewrite_header(&mut self) -> Result<(), DeltaError> {
        let mut header = write_varint(self.base_size);
        header.extend_from_slice(&write_varint(self.target_size));

        let buf = self.stream.to_mut();
        let old_body = self.body;
        let new_body = header.len();
        if new_body != old_body {
            let body_len = buf.len() - old_body;
            if new_body > old_body {
                let grow = new_body - old_body;
                buf.try_reserve_exact(grow)
                    .map_err(|_| DeltaError::AllocationFailure(grow))?;
                buf.resize(buf.len() + grow, 0);
            }
            buf.copy_within(old_body..old_body + body_len, new_body);
            buf.truncate(new_body + body_len);
        }
        buf[..new_body].copy_from_slice(&header);
        self.body = new_body;
        Ok(())
    }
}

/// Collapse an ordered chain of delta streams into a single delta.
///
/// The iterator yields the topmost delta first (the one whose target is the
/// desired object), then each successive ancestor; errors from the source
/// are propagated verbatim. The first buffer is adopted without copying;
/// for each further buffer an index is built and the topmost stream is
/// rewritten against it, so after the last buffer every copy references the
/// ultimate base.
///
/// Fails with [`DeltaError::NoStreams`] on an empty iterator,
/// [`DeltaError::OversizedDelta`] if any stream (or the collapsed stream)
/// exceeds 4 GiB, and [`DeltaError::InvalidDelta`] on malformed streams or
/// adjacent chain links whose sizes disagree.
pub fn connect_deltas<'a, I>(streams: I) -> Result<CollapsedDelta<'a>, DeltaError>
where
    I: IntoIterator<Item = Result<Cow<'a, [u8]>, DeltaError>>,
{
    let mut streams = streams.into_iter();

    let first = streams.next().ok_or(DeltaError::NoStreams)??;
    if first.len() as u64 > MAX_DELTA_SIZE {
        return Err(DeltaError::OversizedDelta(first.len() as u64));
    }
    let (base_size, target_size, body) = read_header(&first)?;
    let mut top = CollapsedDelta {
        stream: first,
        body,
        base_size,
        target_size,
        num_chunks: 0,
    };

    let mut entries: Vec<DeltaInfo> = Vec::new();
    let mut shifts: Vec<OpShift> = Vec::new();
    let mut composed = false;

    for next in streams {
        let next = next?;
        if next.len() as u64 > MAX_DELTA_SIZE {
            return Err(DeltaError::OversizedDelta(next.len() as u64));
        }

        if !composed {
            top.materialize()?;
            composed = true;
        }

        let idx = DeltaIndex::parse_with(&next, std::mem::take(&mut entries))?;
        if idx.target_size() != top.base_size {
            return Err(DeltaError::InvalidDelta {
                offset: 0,
                reason: format!(
                    "chain link size mismatch: expected base of {}, ancestor produces {}",
                    top.base_size,
                    idx.target_size()
                ),
            });
        }

        top.rebase_onto(&idx, &mut shifts)?;
        top.base_size = idx.base_size();
        entries = idx.into_entries();
    }

    if composed {
        top.rewrite_header()?;
    }

    Ok(top)
}
