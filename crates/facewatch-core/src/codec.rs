//! Persisted embedding encoding.
//!
//! Embeddings are stored as a headerless array of little-endian IEEE-754
//! binary32 values, `4 * dim` bytes long. Reading back never widens or
//! narrows the type, so `decode(encode(e)) == e` bit for bit.

use crate::types::Embedding;
use thiserror::Error;

/// Bytes per persisted component.
pub const BYTES_PER_VALUE: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreLoadError {
    #[error("embedding blob has {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },
    #[error("embedding component {index} is not finite")]
    NonFinite { index: usize },
    #[error("label is empty")]
    EmptyLabel,
    #[error("row for label {label:?}: {source}")]
    Row {
        label: String,
        #[source]
        source: Box<StoreLoadError>,
    },
}

/// Serialize an embedding to its persisted byte form.
pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.values.len() * BYTES_PER_VALUE);
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Parse a persisted blob into an embedding of exactly `dim` components.
pub fn decode(bytes: &[u8], dim: usize) -> Result<Embedding, StoreLoadError> {
    let expected = dim * BYTES_PER_VALUE;
    if bytes.len() != expected {
        return Err(StoreLoadError::Length {
            expected,
            actual: bytes.len(),
        });
    }

    let mut values = Vec::with_capacity(dim);
    for (index, chunk) in bytes.chunks_exact(BYTES_PER_VALUE).enumerate() {
        let mut raw = [0u8; BYTES_PER_VALUE];
        raw.copy_from_slice(chunk);
        let v = f32::from_le_bytes(raw);
        if !v.is_finite() {
            return Err(StoreLoadError::NonFinite { index });
        }
        values.push(v);
    }

    Ok(Embedding { values })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout_little_endian() {
        let e = Embedding::new(vec![1.0, -2.5]);
        let bytes = encode(&e);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-2.5f32).to_le_bytes());
    }

    #[test]
    fn test_roundtrip_is_bit_exact() {
        let values: Vec<f32> = (0..128)
            .map(|i| ((i as f32) * 0.618_034).sin() / 3.0 + f32::EPSILON * i as f32)
            .collect();
        let e = Embedding::new(values);
        let back = decode(&encode(&e), 128).unwrap();
        for (a, b) in e.values.iter().zip(back.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_roundtrip_extremes() {
        let e = Embedding::new(vec![f32::MIN, f32::MAX, f32::MIN_POSITIVE, -0.0, 0.0]);
        assert_eq!(decode(&encode(&e), 5).unwrap(), e);
    }

    #[test]
    fn test_decode_wrong_length() {
        // A blob written with 8-byte floats is not silently reinterpreted.
        let wide: Vec<u8> = [0.25f64, 0.5f64]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let err = decode(&wide, 2).unwrap_err();
        assert_eq!(err, StoreLoadError::Length { expected: 8, actual: 16 });
    }

    #[test]
    fn test_decode_rejects_nan() {
        let mut bytes = encode(&Embedding::new(vec![0.1, 0.2]));
        bytes[4..].copy_from_slice(&f32::NAN.to_le_bytes());
        assert_eq!(decode(&bytes, 2).unwrap_err(), StoreLoadError::NonFinite { index: 1 });
    }

    #[test]
    fn test_decode_empty_dim_zero() {
        assert!(decode(&[], 0).unwrap().values.is_empty());
    }
}
