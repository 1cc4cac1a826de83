use crate::binary_patch::{checksum, int_width, put_int};
use crate::rolling_hash::{RollingHash, WINDOW};

/// Candidate source blocks examined per target position.
const MAX_CANDIDATES: usize = 250;

/// Compute a Fossil delta that turns `source` into `target`.
///
/// Block-matching in the style of rsync:
/// 1. Index `source` by the rolling hash of each `WINDOW`-aligned block
/// 2. Slide a rolling hash over `target`, probing the index at every offset
/// 3. Extend each hit forwards and backwards, keep the longest
/// 4. Emit a copy when it is shorter than the literal it replaces
pub fn compute_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    let mut delta = Vec::new();
    put_int(&mut delta, target.len() as u64);
    delta.push(b'\n');

    if source.len() <= WINDOW {
        push_literal(&mut delta, target);
        push_checksum(&mut delta, target);
        return delta;
    }

    let index = BlockIndex::build(source);
    let mut base = 0usize;

    while base + WINDOW < target.len() {
        let mut hash = RollingHash::new(&target[base..]);
        let mut i = 0usize;

        loop {
            if let Some(found) = index.best_match(source, target, base, i, hash.digest()) {
                push_literal(&mut delta, &target[base..base + found.literal]);
                base += found.literal;

                put_int(&mut delta, found.len as u64);
                delta.push(b'@');
                put_int(&mut delta, found.offset as u64);
                delta.push(b',');
                base += found.len;
                break;
            }

            if base + i + WINDOW >= target.len() {
                push_literal(&mut delta, &target[base..]);
                base = target.len();
                break;
            }

            hash.rotate(target[base + i + WINDOW]);
            i += 1;
        }
    }

    if base < target.len() {
        push_literal(&mut delta, &target[base..]);
    }
    push_checksum(&mut delta, target);
    delta
}

fn push_literal(delta: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    put_int(delta, bytes.len() as u64);
    delta.push(b':');
    delta.extend_from_slice(bytes);
}

fn push_checksum(delta: &mut Vec<u8>, target: &[u8]) {
    put_int(delta, checksum(target) as u64);
    delta.push(b';');
}

struct Match {
    /// Literal bytes between `base` and the start of the copy.
    literal: usize,
    offset: usize,
    len: usize,
}

/// Hash table over source blocks, chained through `collide`.
struct BlockIndex {
    landmark: Vec<Option<usize>>,
    collide: Vec<Option<usize>>,
}

impl BlockIndex {
    fn build(source: &[u8]) -> Self {
        let slots = source.len() / WINDOW;
        let mut landmark = vec![None; slots];
        let mut collide = vec![None; slots];

        for block in 0..(source.len() - 1) / WINDOW {
            let start = block * WINDOW;
            let slot = RollingHash::new(&source[start..]).digest() as usize % slots;
            collide[block] = landmark[slot];
            landmark[slot] = Some(block);
        }

        Self { landmark, collide }
    }

    /// Longest worthwhile copy for the target window at `base + i`.
    fn best_match(
        &self,
        source: &[u8],
        target: &[u8],
        base: usize,
        i: usize,
        digest: u32,
    ) -> Option<Match> {
        let mut best: Option<Match> = None;
        let mut candidate = self.landmark[digest as usize % self.landmark.len()];
        let mut probes = 0;

        while let Some(block) = candidate {
            if probes == MAX_CANDIDATES {
                break;
            }
            probes += 1;

            let src = block * WINDOW;
            let forward = source[src..]
                .iter()
                .zip(&target[base + i..])
                .take_while(|(a, b)| a == b)
                .count();
            let backward = (1..=src.min(i))
                .take_while(|&k| source[src - k] == target[base + i - k])
                .count();

            let len = forward + backward;
            let offset = src - backward;
            let literal = i - backward;
            let cost = int_width(literal as u64)
                + int_width(len as u64)
                + int_width(offset as u64)
                + 3;

            if len as u64 >= cost && best.as_ref().map_or(true, |b| len > b.len) {
                best = Some(Match {
                    literal,
                    offset,
                    len,
                });
            }

            candidate = self.collide[block];
        }

        best
    }
}
