//! Content fingerprints for the inference cache.
//!
//! A fingerprint is a SHA-256 digest over the raw image bytes and the
//! generation parameters. Including the parameters means two requests for the
//! same image with different sampling settings never share a cache entry.

use crate::pipeline::engine::GenerationRequest;
use sha2::{Digest, Sha256};

/// A cache key derived from image content and generation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Returns the fingerprint as a lowercase hex string, suitable for use as
    /// a file name.
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint for an image / request pair.
pub fn fingerprint(image_bytes: &[u8], request: &GenerationRequest) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(image_bytes);
    hasher.update((request.max_new_tokens as u64).to_le_bytes());
    hasher.update(request.temperature.to_bits().to_le_bytes());
    hasher.update(request.min_p.to_bits().to_le_bytes());
    let digest = hasher.finalize();
    use std::fmt::Write;
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Fingerprint(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(max_new_tokens: usize, temperature: f32, min_p: f32) -> GenerationRequest {
        GenerationRequest {
            max_new_tokens,
            temperature,
            min_p,
        }
    }

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let req = request(256, 0.7, 0.1);
        assert_eq!(fingerprint(b"pixels", &req), fingerprint(b"pixels", &req));
    }

    #[test]
    fn different_bytes_produce_different_fingerprints() {
        let req = request(256, 0.7, 0.1);
        assert_ne!(fingerprint(b"pixels", &req), fingerprint(b"other", &req));
    }

    #[test]
    fn different_parameters_produce_different_fingerprints() {
        let base = request(256, 0.7, 0.1);
        assert_ne!(
            fingerprint(b"pixels", &base),
            fingerprint(b"pixels", &request(128, 0.7, 0.1))
        );
        assert_ne!(
            fingerprint(b"pixels", &base),
            fingerprint(b"pixels", &request(256, 0.9, 0.1))
        );
        assert_ne!(
            fingerprint(b"pixels", &base),
            fingerprint(b"pixels", &request(256, 0.7, 0.2))
        );
    }

    #[test]
    fn fingerprint_is_hex_of_sha256_length() {
        let fp = fingerprint(b"pixels", &request(256, 0.7, 0.1));
        assert_eq!(fp.as_hex().len(), 64);
        assert!(fp.as_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
