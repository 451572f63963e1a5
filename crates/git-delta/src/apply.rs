//! Apply a single delta stream to a base object.

use crate::opcode::{read_header, Opcode};
use crate::DeltaError;

/// Apply a delta instruction stream to a base object, producing the target.
///
/// Validates the declared base size against `base`, bounds-checks every
/// copy, and verifies the produced length against the declared target size.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let (base_size, target_size, mut pos) = read_header(delta)?;

    if base_size != base.len() as u64 {
        return Err(DeltaError::InvalidDelta {
            offset: 0,
            reason: format!(
                "base size mismatch: delta says {base_size}, base is {}",
                base.len()
            ),
        });
    }

    let mut output = Vec::new();
    output
        .try_reserve_exact(target_size as usize)
        .map_err(|_| DeltaError::AllocationFailure(target_size as usize))?;

    while pos < delta.len() {
        let (op, next) = Opcode::parse(delta, pos)?;
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
                output.extend_from_slice(&base[start..end]);
            }
            Opcode::Insert(data) => output.extend_from_slice(data),
        }
        pos = next;
    }

    if output.len() as u64 != target_size {
        return Err(DeltaError::InvalidDelta {
            offset: 0,
            reason: format!(
                "target size mismatch: delta says {target_size}, got {}",
                output.len()
            ),
        });
    }

    Ok(output)
}

/// Apply a delta stream into a caller-provided buffer.
///
/// `target` must be exactly as long as the delta's declared target size;
/// the instruction loop fills it front to back.
pub fn apply_delta_into(base: &[u8], delta: &[u8], target: &mut [u8]) -> Result<(), DeltaError> {
    let (base_size, target_size, mut pos) = read_header(delta)?;

    if base_size != base.len() as u64 {
        return Err(DeltaError::InvalidDelta {
            offset: 0,
            reason: format!(
                "base size mismatch: delta says {base_size}, base is {}",
                base.len()
            ),
        });
    }
    if target_size != target.len() as u64 {
        return Err(DeltaError::InvalidDelta {
            offset: 0,
            reason: format!(
                "target buffer is {} bytes, delta produces {target_size}",
                target.len()
            ),
        });
    }

    let mut cursor = 0usize;
    while pos < delta.len() {
        let (op, next) = Opcode::parse(delta, pos)?;
        let n = op.output_size() as usize;
        if cursor + n > target.len() {
            return Err(DeltaError::InvalidDelta {
                offset: pos as u64,
                reason: "instructions overflow declared target size".into(),
            });
        }
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
                target[cursor..cursor + n].copy_from_slice(&base[start..end]);
            }
            Opcode::Insert(data) => target[cursor..cursor + n].copy_from_slice(data),
        }
        cursor += n;
        pos = next;
    }

    if cursor != target.len() {
        return Err(DeltaError::InvalidDelta {
            offset: 0,
            reason: format!(
                "target size mismatch: delta says {target_size}, got {cursor}"
            ),
        });
    }

    Ok(())
}
