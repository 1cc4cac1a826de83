//! Patch blob encoding.
//!
//! ```text
//! blob      = secretbox(key = fingerprint digest, nonce = 0^24, deflate_raw(payload))
//!           = [16 bytes: Poly1305 tag][ciphertext]
//! payload   = msgpack [filename, total_size, chunk_size, delta_0, delta_1, ...]
//! ```
//!
//! The nonce is always zero. Every key is derived from distinct file content
//! and seals exactly one patch, so a (key, nonce) pair is never reused.

use crypto_secretbox::aead::{self, AeadInPlace, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rmpv::Value;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::PatchError;
use crate::fingerprint::Fingerprint;
use crate::patch_format::{PatchDescriptor, NONCE_LEN, TAG_LEN};

const ZERO_NONCE: [u8; NONCE_LEN] = [0; NONCE_LEN];

fn cipher(fingerprint: &Fingerprint) -> XSalsa20Poly1305 {
    XSalsa20Poly1305::new(aead::Key::<XSalsa20Poly1305>::from_slice(fingerprint.digest()))
}

/// Authenticate and decrypt a blob fetched from the origin.
pub fn open_blob(blob: &[u8], fingerprint: &Fingerprint) -> Result<Vec<u8>, PatchError> {
    if blob.len() < TAG_LEN {
        return Err(PatchError::CorruptedPatch);
    }
    let (tag, ciphertext) = blob.split_at(TAG_LEN);
    let mut buffer = ciphertext.to_vec();

    cipher(fingerprint)
        .decrypt_in_place_detached(
            aead::Nonce::<XSalsa20Poly1305>::from_slice(&ZERO_NONCE),
            b"",
            &mut buffer,
            aead::Tag::<XSalsa20Poly1305>::from_slice(tag),
        )
        .map_err(|_| PatchError::CorruptedPatch)?;

    Ok(buffer)
}

/// Seal `plaintext` for the file identified by `fingerprint`.
pub fn seal_blob(plaintext: &[u8], fingerprint: &Fingerprint) -> Result<Vec<u8>, PatchError> {
    let mut buffer = plaintext.to_vec();
    let tag = cipher(fingerprint)
        .encrypt_in_place_detached(
            aead::Nonce::<XSalsa20Poly1305>::from_slice(&ZERO_NONCE),
            b"",
            &mut buffer,
        )
        .map_err(|e| PatchError::Malformed(format!("patch encryption failed: {e}")))?;

    let mut blob = Vec::with_capacity(TAG_LEN + buffer.len());
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&buffer);
    Ok(blob)
}

/// Inflate a raw DEFLATE stream (no zlib or gzip header).
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(PatchError::Decompress)?;
    Ok(out)
}

pub fn deflate(data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decode the msgpack payload into a descriptor.
pub fn parse_descriptor(bytes: &[u8]) -> Result<PatchDescriptor, PatchError> {
    let value = rmpv::decode::read_value(&mut &bytes[..])
        .map_err(|e| PatchError::Malformed(format!("invalid msgpack: {e}")))?;

    let Value::Array(items) = value else {
        return Err(PatchError::Malformed("payload is not an array".into()));
    };
    if items.len() < 3 {
        return Err(PatchError::Malformed(format!(
            "payload has {} fields, expected at least 3",
            items.len()
        )));
    }

    let mut items = items.into_iter();
    let filename = match items.next() {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| PatchError::Malformed("filename is not UTF-8".into()))?,
        _ => return Err(PatchError::Malformed("filename is not a string".into())),
    };
    let filename = sanitize_filename(&filename)?;
    let total_size = unsigned(items.next(), "total size")?;
    let chunk_size = unsigned(items.next(), "chunk size")?;
    if chunk_size == 0 {
        return Err(PatchError::Malformed("chunk size is zero".into()));
    }

    let deltas = items
        .enumerate()
        .map(|(i, item)| match item {
            Value::Binary(bytes) => Ok(bytes),
            Value::String(s) => Ok(s.into_bytes()),
            other => Err(PatchError::Malformed(format!(
                "delta {i} is {other:?}, expected bytes"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PatchDescriptor {
        filename,
        total_size,
        chunk_size,
        deltas,
    })
}

fn unsigned(value: Option<Value>, field: &str) -> Result<u64, PatchError> {
    value
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| PatchError::Malformed(format!("{field} is not an unsigned integer")))
}

/// Keep only the final path component of a server-supplied name.
fn sanitize_filename(name: &str) -> Result<String, PatchError> {
    let normalized = name.replace('\\', "/");
    Path::new(&normalized)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| PatchError::Malformed(format!("unusable filename {name:?}")))
}

pub fn encode_descriptor(descriptor: &PatchDescriptor) -> Result<Vec<u8>, PatchError> {
    let mut items = Vec::with_capacity(3 + descriptor.deltas.len());
    items.push(Value::from(descriptor.filename.as_str()));
    items.push(Value::from(descriptor.total_size));
    items.push(Value::from(descriptor.chunk_size));
    items.extend(descriptor.deltas.iter().cloned().map(Value::Binary));

    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &Value::Array(items))
        .map_err(|e| PatchError::Malformed(format!("msgpack encoding failed: {e}")))?;
    Ok(out)
}

/// Decrypt, inflate and parse a fetched blob.
pub fn decode_patch(blob: &[u8], fingerprint: &Fingerprint) -> Result<PatchDescriptor, PatchError> {
    let compressed = open_blob(blob, fingerprint)?;
    let payload = inflate(&compressed)?;
    let descriptor = parse_descriptor(&payload)?;
    tracing::debug!(
        %fingerprint,
        filename = %descriptor.filename,
        total_size = descriptor.total_size,
        chunks = descriptor.deltas.len(),
        "decoded patch"
    );
    Ok(descriptor)
}

/// Inverse of [`decode_patch`], used when publishing.
pub fn encode_patch(
    descriptor: &PatchDescriptor,
    fingerprint: &Fingerprint,
) -> Result<Vec<u8>, PatchError> {
    let payload = encode_descriptor(descriptor)?;
    let compressed = deflate(&payload)?;
    seal_blob(&compressed, fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;
    use crate::patch_format::DEFAULT_KEY;

    fn sample() -> PatchDescriptor {
        PatchDescriptor {
            filename: "game-v2.bin".into(),
            total_size: 3_000_000,
            chunk_size: 1024 * 1024,
            deltas: vec![b"delta zero".to_vec(), vec![0, 1, 2, 255], Vec::new()],
        }
    }

    #[test]
    fn test_decode_recovers_descriptor() {
        let fp = fingerprint_bytes(DEFAULT_KEY, b"old content");
        let blob = encode_patch(&sample(), &fp).unwrap();
        assert_eq!(decode_patch(&blob, &fp).unwrap(), sample());
    }

    #[test]
    fn test_blob_layout_is_tag_then_ciphertext() {
        let fp = fingerprint_bytes(DEFAULT_KEY, b"x");
        let blob = seal_blob(b"hello", &fp).unwrap();
        assert_eq!(blob.len(), TAG_LEN + 5);
        assert_eq!(open_blob(&blob, &fp).unwrap(), b"hello");
    }

    #[test]
    fn test_sealed_with_all_zero_nonce() {
        let fp = fingerprint_bytes(DEFAULT_KEY, b"x");
        let blob = seal_blob(b"hello", &fp).unwrap();

        let nonce = [0u8; 24];
        let mut buffer = blob[TAG_LEN..].to_vec();
        cipher(&fp)
            .decrypt_in_place_detached(
                aead::Nonce::<XSalsa20Poly1305>::from_slice(&nonce),
                b"",
                &mut buffer,
                aead::Tag::<XSalsa20Poly1305>::from_slice(&blob[..TAG_LEN]),
            )
            .unwrap();
        assert_eq!(buffer, b"hello");
        assert_eq!(ZERO_NONCE.len(), NONCE_LEN);
    }

    #[test]
    fn test_wrong_key_is_corrupted() {
        let right = fingerprint_bytes(DEFAULT_KEY, b"old content");
        let wrong = fingerprint_bytes(DEFAULT_KEY, b"other content");
        let blob = encode_patch(&sample(), &right).unwrap();
        assert!(matches!(
            decode_patch(&blob, &wrong),
            Err(PatchError::CorruptedPatch)
        ));
    }

    #[test]
    fn test_tampered_blob_is_corrupted() {
        let fp = fingerprint_bytes(DEFAULT_KEY, b"old content");
        let mut blob = encode_patch(&sample(), &fp).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(open_blob(&blob, &fp), Err(PatchError::CorruptedPatch)));
        assert!(matches!(open_blob(&blob[..10], &fp), Err(PatchError::CorruptedPatch)));
    }

    #[test]
    fn test_bad_deflate_is_decompress_error() {
        let fp = fingerprint_bytes(DEFAULT_KEY, b"old content");
        let blob = seal_blob(&[0xFF; 32], &fp).unwrap();
        assert!(matches!(decode_patch(&blob, &fp), Err(PatchError::Decompress(_))));
    }

    #[test]
    fn test_string_deltas_are_accepted() {
        let payload = Value::Array(vec![
            Value::from("a.txt"),
            Value::from(3u64),
            Value::from(16u64),
            Value::from("3\n3:abc"),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &payload).unwrap();

        let descriptor = parse_descriptor(&bytes).unwrap();
        assert_eq!(descriptor.deltas, vec![b"3\n3:abc".to_vec()]);
    }

    #[test]
    fn test_filename_is_reduced_to_last_component() {
        let mut descriptor = sample();
        descriptor.filename = "../../etc/passwd".into();
        let bytes = encode_descriptor(&descriptor).unwrap();
        assert_eq!(parse_descriptor(&bytes).unwrap().filename, "passwd");

        descriptor.filename = "..".into();
        let bytes = encode_descriptor(&descriptor).unwrap();
        assert!(matches!(parse_descriptor(&bytes), Err(PatchError::Malformed(_))));
    }

    #[test]
    fn test_rejects_wrong_shapes() {
        let cases = [
            Value::from("not an array"),
            Value::Array(vec![Value::from("a"), Value::from(1u64)]),
            Value::Array(vec![Value::from(1u64), Value::from(1u64), Value::from(1u64)]),
            Value::Array(vec![Value::from("a"), Value::from(1u64), Value::from(0u64)]),
            Value::Array(vec![Value::from("a"), Value::from(-1i64), Value::from(4u64)]),
            Value::Array(vec![
                Value::from("a"),
                Value::from(1u64),
                Value::from(4u64),
                Value::from(7u64),
            ]),
        ];
        for value in cases {
            let mut bytes = Vec::new();
            rmpv::encode::write_value(&mut bytes, &value).unwrap();
            assert!(
                matches!(parse_descriptor(&bytes), Err(PatchError::Malformed(_))),
                "{value:?} should be rejected"
            );
        }
    }
}
