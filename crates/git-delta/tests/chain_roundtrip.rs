//! End-to-end chain collapsing against a naive materialise-and-reapply
//! reference.

use std::borrow::Cow;

use git_delta::opcode::{encode_copy, encode_insert, write_varint};
use git_delta::{apply_delta, connect_deltas, CollapsedDelta, DeltaError, DeltaIndex};

fn build_delta(base_size: u64, target_size: u64, instructions: &[u8]) -> Vec<u8> {
    let mut delta = write_varint(base_size);
    delta.extend_from_slice(&write_varint(target_size));
    delta.extend_from_slice(instructions);
    delta
}

/// Collapse a chain given topmost-first, as the pack reader would hand it
/// over.
fn collapse(streams: &[Vec<u8>]) -> CollapsedDelta<'_> {
    connect_deltas(streams.iter().map(|s| Ok(Cow::Borrowed(s.as_slice())))).unwrap()
}

/// Reference reconstruction: apply the chain deepest-first, materialising
/// every intermediate target.
fn naive_apply(base: &[u8], topmost_first: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = base.to_vec();
    for delta in topmost_first.iter().rev() {
        buf = apply_delta(&buf, delta).unwrap();
    }
    buf
}

#[test]
fn trivial_apply() {
    let base = b"Hello, world";
    // COPY 5 bytes from offset 7
    let delta: Vec<u8> = vec![12, 5, 0x91, 0x07, 0x05];
    assert_eq!(apply_delta(base, &delta).unwrap(), b"world");

    let collapsed = collapse(std::slice::from_ref(&delta));
    assert_eq!(collapsed.rbound(), 5);
    assert_eq!(collapsed.apply_to_vec(base).unwrap(), b"world");
}

#[test]
fn insert_only() {
    let delta: Vec<u8> = vec![0, 3, 0x03, b'a', b'b', b'c'];
    assert_eq!(apply_delta(b"", &delta).unwrap(), b"abc");
}

#[test]
fn copy_insert_mix() {
    // COPY 2 from offset 0, then INSERT "XY"
    let delta: Vec<u8> = vec![2, 4, 0x90, 0x02, 0x02, b'X', b'Y'];
    assert_eq!(apply_delta(b"AB", &delta).unwrap(), b"ABXY");
}

#[test]
fn two_level_collapse() {
    let base = b"0123456789";

    // reverses the base with ten one-byte copies at descending offsets
    let mut ops = Vec::new();
    for i in 0..10u32 {
        ops.extend_from_slice(&encode_copy(9 - i, 1));
    }
    let d1 = build_delta(10, 10, &ops);
    assert_eq!(apply_delta(base, &d1).unwrap(), b"9876543210");

    // takes the first two bytes of the reversed string
    let d2 = build_delta(10, 2, &encode_copy(0, 2));

    let chain = vec![d2, d1];
    let collapsed = collapse(&chain);
    assert_eq!(collapsed.apply_to_vec(base).unwrap(), b"98");
    assert_eq!(collapsed.apply_to_vec(base).unwrap(), naive_apply(base, &chain));
}

#[test]
fn copy_of_insert_becomes_insert() {
    let d1 = build_delta(0, 5, &encode_insert(b"hello"));
    let d2 = build_delta(5, 3, &encode_copy(0, 3));

    let chain = vec![d2, d1];
    let collapsed = collapse(&chain);
    assert_eq!(collapsed.apply_to_vec(b"").unwrap(), b"hel");
    // the collapsed body is a single literal insert
    assert_eq!(collapsed.num_chunks(), 1);
    assert_eq!(collapsed.data(), [0x00, 0x03, 0x03, b'h', b'e', b'l']);
}

#[test]
fn four_level_chain_matches_naive_reference() {
    let base: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();

    // d1: interleave slices of the base with literals
    let mut ops = Vec::new();
    ops.extend_from_slice(&encode_copy(1024, 512));
    ops.extend_from_slice(&encode_insert(&[0xAA; 100]));
    ops.extend_from_slice(&encode_copy(0, 1024));
    let d1 = build_delta(2048, 512 + 100 + 1024, &ops);
    let t1 = apply_delta(&base, &d1).unwrap();

    // d2: shuffle d1's target
    let mut ops = Vec::new();
    ops.extend_from_slice(&encode_copy(600, 800));
    ops.extend_from_slice(&encode_insert(b"mid"));
    ops.extend_from_slice(&encode_copy(0, 600));
    let d2 = build_delta(t1.len() as u64, 800 + 3 + 600, &ops);
    let t2 = apply_delta(&t1, &d2).unwrap();

    // d3: one big copy spanning many of d2's instructions
    let d3 = build_delta(t2.len() as u64, 1200, &encode_copy(100, 1200));
    let t3 = apply_delta(&t2, &d3).unwrap();

    // d4: copies from both ends of d3's target
    let mut ops = Vec::new();
    ops.extend_from_slice(&encode_copy(1100, 100));
    ops.extend_from_slice(&encode_copy(0, 100));
    let d4 = build_delta(t3.len() as u64, 200, &ops);
    let t4 = apply_delta(&t3, &d4).unwrap();

    let chain = vec![d4, d3, d2, d1];
    let collapsed = collapse(&chain);

    assert_eq!(collapsed.rbound(), 200);
    assert_eq!(collapsed.base_size(), 2048);
    assert_eq!(collapsed.apply_to_vec(&base).unwrap(), t4);
    assert_eq!(collapsed.apply_to_vec(&base).unwrap(), naive_apply(&base, &chain));

    // the collapsed stream parses as one delta whose instruction count and
    // size bookkeeping agree with the handle
    let idx = DeltaIndex::parse(collapsed.data()).unwrap();
    assert_eq!(idx.num_ops(), collapsed.num_chunks());
    assert_eq!(idx.target_size(), collapsed.rbound());
    assert_eq!(idx.base_size(), collapsed.base_size());
    assert_eq!(apply_delta(&base, collapsed.data()).unwrap(), t4);
}

#[test]
fn single_element_chain_equals_plain_apply() {
    let base = b"The quick brown fox jumps over the lazy dog";
    let mut ops = Vec::new();
    ops.extend_from_slice(&encode_copy(4, 5)); // "quick"
    ops.extend_from_slice(&encode_insert(b" and "));
    ops.extend_from_slice(&encode_copy(35, 8)); // "lazy dog"
    let delta = build_delta(base.len() as u64, 18, &ops);

    let collapsed = collapse(std::slice::from_ref(&delta));
    assert_eq!(
        collapsed.apply_to_vec(base).unwrap(),
        apply_delta(base, &delta).unwrap()
    );
    assert_eq!(collapsed.data(), delta.as_slice());
}

#[test]
fn copy_spanning_first_and_last_instructions() {
    let base = b"abcdefghij";
    let mut ops = Vec::new();
    ops.extend_from_slice(&encode_copy(0, 4)); // "abcd"
    ops.extend_from_slice(&encode_insert(b"123")); // "123"
    ops.extend_from_slice(&encode_copy(6, 4)); // "ghij"
    let d1 = build_delta(10, 11, &ops);

    // partial at both ends: skips "a", drops "ij"
    let d2 = build_delta(11, 8, &encode_copy(1, 8));

    let chain = vec![d2, d1];
    let collapsed = collapse(&chain);
    assert_eq!(collapsed.apply_to_vec(base).unwrap(), b"bcd123gh");
    assert_eq!(collapsed.num_chunks(), 3);
}

#[test]
fn copy_64k_wire_form_through_collapse() {
    let base: Vec<u8> = (0..0x11000u32).map(|i| (i % 253) as u8).collect();

    // d1 copies 64K+4K of the base; the first copy uses the zero-size wire
    // form
    let mut ops = encode_copy(0, 0x10000);
    assert_eq!(ops.len(), 1); // bare command byte, offset and size implicit
    ops.extend_from_slice(&encode_copy(0x10000, 0x1000));
    let d1 = build_delta(base.len() as u64, 0x11000, &ops);

    // d2 copies a range straddling the 64K boundary
    let d2 = build_delta(0x11000, 0x2000, &encode_copy(0xF000, 0x2000));

    let chain = vec![d2, d1];
    let collapsed = collapse(&chain);
    assert_eq!(
        collapsed.apply_to_vec(&base).unwrap(),
        naive_apply(&base, &chain)
    );
}

#[test]
fn deep_chain_of_trivial_deltas() {
    // fifty levels, each reversing an 8-byte buffer with one-byte copies
    let base = b"abcdefgh".to_vec();
    let mut ops = Vec::new();
    for i in 0..8u32 {
        ops.extend_from_slice(&encode_copy(7 - i, 1));
    }
    let reverse = build_delta(8, 8, &ops);

    let chain: Vec<Vec<u8>> = (0..50).map(|_| reverse.clone()).collect();
    let collapsed = collapse(&chain);
    let expected = naive_apply(&base, &chain);
    assert_eq!(collapsed.apply_to_vec(&base).unwrap(), expected);
    // even number of reversals: back to the original
    assert_eq!(expected, base);

    // fifty compositions of an 8-op delta must not blow up the collapsed
    // stream
    assert!(collapsed.data().len() < 8 * 64);
}

#[test]
fn empty_target_collapses_to_empty() {
    let d1 = build_delta(4, 6, &{
        let mut ops = encode_copy(0, 4);
        ops.extend_from_slice(&encode_insert(b"xx"));
        ops
    });
    let d2 = build_delta(6, 0, &[]);

    let chain = vec![d2, d1];
    let collapsed = collapse(&chain);
    assert_eq!(collapsed.rbound(), 0);
    assert_eq!(collapsed.apply_to_vec(b"abcd").unwrap(), b"");
}

#[test]
fn error_cases() {
    // empty iterator
    assert!(matches!(
        connect_deltas(std::iter::empty::<Result<Cow<'_, [u8]>, DeltaError>>()),
        Err(DeltaError::NoStreams)
    ));

    // zero command byte
    let bad = vec![0u8, 1, 0x00];
    assert!(matches!(
        apply_delta(b"", &bad),
        Err(DeltaError::InvalidDelta { .. })
    ));

    // declared size over 2^32
    let oversized = build_delta((1u64 << 32) + 1, 1, &encode_insert(b"a"));
    assert!(matches!(
        apply_delta(b"", &oversized),
        Err(DeltaError::OversizedDelta(_))
    ));

    // ancestor target does not match topmost base
    let top = build_delta(9, 1, &encode_copy(0, 1));
    let ancestor = build_delta(0, 5, &encode_insert(b"hello"));
    let streams = [top, ancestor];
    let result = connect_deltas(streams.iter().map(|s| Ok(Cow::Borrowed(s.as_slice()))));
    assert!(matches!(result, Err(DeltaError::InvalidDelta { .. })));
}
