//! Checksum utilities for staging verification and manifest hashing
//!
//! Every checksum in imgpipe is a lowercase hex SHA-256 digest. Object
//! checksums are computed over the raw bytes; manifest content hashes are
//! computed over the JSON encoding of the entry list, so two publishes of
//! the same entries always hash the same.

use crate::error::{CommonError, Result};
use crate::types::ManifestEntry;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 of an in-memory buffer
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of any readable source, streamed in fixed-size chunks
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a file on disk
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Verify a file against an expected digest (case-insensitive)
pub fn verify_file_sha256(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Content hash of a manifest's entry list
pub fn manifest_content_hash(entries: &[ManifestEntry]) -> Result<String> {
    let encoded = serde_json::to_vec(entries)?;
    Ok(sha256_bytes(&encoded))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_reader_matches_bytes() {
        let data = vec![7u8; READ_BUFFER_SIZE * 2 + 13];
        let mut cursor = Cursor::new(data.clone());
        assert_eq!(sha256_reader(&mut cursor).unwrap(), sha256_bytes(&data));
    }

    #[test]
    fn test_verify_file_sha256() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        verify_file_sha256(
            file.path(),
            "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9",
        )
        .unwrap();

        let err = verify_file_sha256(file.path(), "deadbeef").unwrap_err();
        assert!(matches!(err, CommonError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_manifest_hash_depends_on_content() {
        let a = vec![ManifestEntry::new("s3://raw/a.jpg", vec!["s3://aug/a_aug.jpg".into()])];
        let mut b = a.clone();
        assert_eq!(
            manifest_content_hash(&a).unwrap(),
            manifest_content_hash(&b).unwrap()
        );

        b[0].width = Some(640);
        assert_ne!(
            manifest_content_hash(&a).unwrap(),
            manifest_content_hash(&b).unwrap()
        );
    }
}
