//! Shared types for upload sessions and pipelines

use serde::{Deserialize, Serialize};

/// Client-declared metadata for an upload, captured at `init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Original file name
    pub name: String,
    /// Declared size in bytes; assembly verifies against this
    pub size: u64,
    /// MIME type, e.g. `audio/mpeg` (drives the stt stage)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Requested processing resource (`ocr`, `file_search`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_resource: Option<String>,
    /// Agent the upload is associated with, passed through to stage handlers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Digest algorithm for chunk integrity checks.
///
/// MD5 is the protocol default; SHA-256 is available via `CHUNK_DIGEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn digest_hex(&self, bytes: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 => {
                use md5::{Digest, Md5};
                let mut hasher = Md5::new();
                hasher.update(bytes);
                hex::encode(hasher.finalize())
            }
            DigestAlgorithm::Sha256 => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                hex::encode(hasher.finalize())
            }
        }
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(format!("unknown digest algorithm: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_digest_known_vector() {
        // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
        assert_eq!(
            DigestAlgorithm::Md5.digest_hex(b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn sha256_digest_known_vector() {
        assert_eq!(
            DigestAlgorithm::Sha256.digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_algorithm_parses() {
        assert_eq!(
            "md5".parse::<DigestAlgorithm>().unwrap(),
            DigestAlgorithm::Md5
        );
        assert_eq!(
            "SHA256".parse::<DigestAlgorithm>().unwrap(),
            DigestAlgorithm::Sha256
        );
        assert!("crc32".parse::<DigestAlgorithm>().is_err());
    }

    #[test]
    fn metadata_deserializes_wire_names() {
        let meta: FileMetadata = serde_json::from_str(
            r#"{"name":"scan.pdf","size":1024,"type":"application/pdf","toolResource":"ocr"}"#,
        )
        .unwrap();
        assert_eq!(meta.name, "scan.pdf");
        assert_eq!(meta.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(meta.tool_resource.as_deref(), Some("ocr"));
        assert!(meta.agent_id.is_none());
    }
}
