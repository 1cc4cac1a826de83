//! Fossil delta decoding.
//!
//! A delta is `<target size>\n` followed by commands:
//! `N@O,` copies N bytes from source offset O, `N:` inserts the next N delta
//! bytes, and `C;` ends the delta, C being [`checksum`] of the output.
//! Integers are written in a base-64 alphabet, most significant digit first.

use thiserror::Error;

const DIGITS: &[u8; 64] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz~";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("size header is missing or not terminated by a newline")]
    MissingHeader,
    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,
    #[error("copy of {len} bytes at offset {offset} exceeds source of {source_len} bytes")]
    CopyOutOfBounds {
        offset: u64,
        len: u64,
        source_len: usize,
    },
    #[error("copy command is missing its ',' terminator")]
    MissingCopyTerminator,
    #[error("literal of {len} bytes runs past the end of the delta")]
    LiteralOutOfBounds { len: u64 },
    #[error("output would exceed the declared {limit} bytes")]
    OutputTooLarge { limit: u64 },
    #[error("unknown delta operator {0:#04x}")]
    UnknownOperator(u8),
    #[error("checksum mismatch: delta says {expected:#010x}, output is {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("output is {actual} bytes, delta declares {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("delta ends without a checksum terminator")]
    Unterminated,
}

fn digit_value(byte: u8) -> Option<u64> {
    let v = match byte {
        b'0'..=b'9' => byte - b'0',
        b'A'..=b'Z' => byte - b'A' + 10,
        b'_' => 36,
        b'a'..=b'z' => byte - b'a' + 37,
        b'~' => 63,
        _ => return None,
    };
    Some(v as u64)
}

/// Append `value` in the delta integer alphabet.
pub(crate) fn put_int(out: &mut Vec<u8>, mut value: u64) {
    if value == 0 {
        out.push(b'0');
        return;
    }
    let mut buf = [0u8; 11];
    let mut i = buf.len();
    while value > 0 {
        i -= 1;
        buf[i] = DIGITS[(value & 0x3f) as usize];
        value >>= 6;
    }
    out.extend_from_slice(&buf[i..]);
}

/// Number of characters `put_int` emits for `value`.
pub(crate) fn int_width(mut value: u64) -> u64 {
    let mut width = 1;
    while value >= 64 {
        value >>= 6;
        width += 1;
    }
    width
}

/// Fossil's 32-bit checksum: big-endian word sum with the tail folded in.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sums = [0u32; 4];
    let mut words = data.chunks_exact(4);
    for word in &mut words {
        for (sum, &byte) in sums.iter_mut().zip(word) {
            *sum = sum.wrapping_add(byte as u32);
        }
    }

    let mut total = sums[3]
        .wrapping_add(sums[2] << 8)
        .wrapping_add(sums[1] << 16)
        .wrapping_add(sums[0] << 24);

    let tail = words.remainder();
    for (i, &byte) in tail.iter().enumerate() {
        total = total.wrapping_add((byte as u32) << (24 - 8 * i));
    }
    total
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn has_bytes(&self) -> bool {
        self.pos < self.data.len()
    }

    fn next_byte(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    fn read_int(&mut self) -> Result<u64, DeltaError> {
        let mut value: u64 = 0;
        while let Some(digit) = self.data.get(self.pos).copied().and_then(digit_value) {
            if value > u64::MAX >> 6 {
                return Err(DeltaError::IntegerOverflow);
            }
            value = (value << 6) | digit;
            self.pos += 1;
        }
        Ok(value)
    }

    fn take(&mut self, len: u64) -> Option<&'a [u8]> {
        let len = usize::try_from(len).ok()?;
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }
}

fn exceeds(written: usize, count: u64, limit: u64) -> bool {
    (written as u64).checked_add(count).map_or(true, |n| n > limit)
}

/// Rebuild the target bytes from `source` and a Fossil `delta`.
pub fn apply_delta(source: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut reader = Reader { data: delta, pos: 0 };
    let limit = reader.read_int()?;
    if reader.next_byte() != Some(b'\n') {
        return Err(DeltaError::MissingHeader);
    }

    // Cap the up-front reservation: the header is untrusted.
    let mut out = Vec::with_capacity(limit.min(64 * 1024 * 1024) as usize);

    while reader.has_bytes() {
        let count = reader.read_int()?;
        match reader.next_byte() {
            Some(b'@') => {
                let offset = reader.read_int()?;
                if reader.next_byte() != Some(b',') {
                    return Err(DeltaError::MissingCopyTerminator);
                }
                if exceeds(out.len(), count, limit) {
                    return Err(DeltaError::OutputTooLarge { limit });
                }
                let range = offset
                    .checked_add(count)
                    .filter(|&end| end <= source.len() as u64)
                    .map(|end| offset as usize..end as usize)
                    .ok_or(DeltaError::CopyOutOfBounds {
                        offset,
                        len: count,
                        source_len: source.len(),
                    })?;
                out.extend_from_slice(&source[range]);
            }
            Some(b':') => {
                if exceeds(out.len(), count, limit) {
                    return Err(DeltaError::OutputTooLarge { limit });
                }
                let literal = reader
                    .take(count)
                    .ok_or(DeltaError::LiteralOutOfBounds { len: count })?;
                out.extend_from_slice(literal);
            }
            Some(b';') => {
                let actual = checksum(&out);
                if count != actual as u64 {
                    return Err(DeltaError::ChecksumMismatch {
                        expected: count as u32,
                        actual,
                    });
                }
                if out.len() as u64 != limit {
                    return Err(DeltaError::SizeMismatch {
                        expected: limit,
                        actual: out.len() as u64,
                    });
                }
                return Ok(out);
            }
            Some(op) => return Err(DeltaError::UnknownOperator(op)),
            None => break,
        }
    }

    Err(DeltaError::Unterminated)
}
