//! Metadata side-entries.
//!
//! A metadata record is a flat string-to-string map stored as a JSON object
//! in an entry named `.metadata.<content name>`.

use crate::error::ArchiveError;
use std::collections::BTreeMap;
use tracing::warn;

/// Reserved prefix of metadata side-entries.
pub const METADATA_PREFIX: &str = ".metadata.";

/// Per-file metadata. A `BTreeMap` keeps the serialised form deterministic.
pub type Metadata = BTreeMap<String, String>;

/// Name of the side-entry that holds metadata for `name`.
pub fn metadata_entry_name(name: &str) -> String {
    format!("{METADATA_PREFIX}{name}")
}

/// True for names that belong to metadata side-entries.
pub fn is_metadata_entry(name: &str) -> bool {
    name.starts_with(METADATA_PREFIX)
}

pub(crate) fn encode(name: &str, metadata: &Metadata) -> Result<Vec<u8>, ArchiveError> {
    serde_json::to_vec(metadata).map_err(|e| ArchiveError::Metadata {
        name: name.to_string(),
        detail: e.to_string(),
    })
}

/// Decodes a side-entry. Anything that is not a JSON object of strings is
/// logged and read as "no metadata".
pub(crate) fn decode(name: &str, bytes: &[u8]) -> Metadata {
    match serde_json::from_slice(bytes) {
        Ok(map) => map,
        Err(e) => {
            warn!(entry = name, error = %e, "Ignoring unreadable metadata");
            Metadata::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_name_roundtrip() {
        let side = metadata_entry_name("scan.pdf");
        assert_eq!(side, ".metadata.scan.pdf");
        assert!(is_metadata_entry(&side));
        assert!(!is_metadata_entry("scan.pdf"));
    }

    #[test]
    fn test_decode_invalid_is_empty() {
        assert!(decode("x", b"not json").is_empty());
        assert!(decode("x", br#"{"tags": 3}"#).is_empty());
    }

    #[test]
    fn test_encode_is_sorted_json() {
        let mut m = Metadata::new();
        m.insert("z".into(), "1".into());
        m.insert("a".into(), "2".into());
        let bytes = encode("f", &m).unwrap();
        assert_eq!(bytes, br#"{"a":"2","z":"1"}"#);
        assert_eq!(decode("f", &bytes), m);
    }
}
