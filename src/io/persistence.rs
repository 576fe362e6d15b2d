//! Versioned binary persistence of a [`SceneCollection`].
//!
//! The on-disk form is one opaque blob: a gzip-compressed JSON document with
//! an explicit schema version tag. Loading checks the tag and re-validates
//! all collection invariants, so a corrupt or incompatible blob surfaces as
//! a [`EoError::Persistence`] error instead of a malformed series.

use crate::core::scene::SceneCollection;
use crate::types::{EoError, EoResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::Path;

/// Version tag of the serialized series schema
pub const FORMAT_VERSION: u32 = 1;

/// Serialize a scene collection into one opaque binary blob
pub fn dump_series(series: &SceneCollection) -> EoResult<Vec<u8>> {
    let document = serde_json::json!({
        "version": FORMAT_VERSION,
        "series": series,
    });
    let json = serde_json::to_vec(&document)
        .map_err(|e| EoError::Persistence(format!("serialization failed: {}", e)))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| EoError::Persistence(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| EoError::Persistence(format!("compression failed: {}", e)))
}

/// Deserialize a blob produced by [`dump_series`] back into an equal series
pub fn load_series(blob: &[u8]) -> EoResult<SceneCollection> {
    let mut decoder = GzDecoder::new(blob);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| EoError::Persistence(format!("corrupt blob: {}", e)))?;
    let document: Value = serde_json::from_slice(&json)
        .map_err(|e| EoError::Persistence(format!("corrupt document: {}", e)))?;
    let version = document
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| EoError::Persistence("document without version tag".to_string()))?;
    if version != FORMAT_VERSION as u64 {
        return Err(EoError::Persistence(format!(
            "unsupported series version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let series = document
        .get("series")
        .cloned()
        .ok_or_else(|| EoError::Persistence("document without series payload".to_string()))?;
    serde_json::from_value(series)
        .map_err(|e| EoError::Persistence(format!("invalid series payload: {}", e)))
}

/// Write a series blob to disk
pub fn write_series<P: AsRef<Path>>(path: P, series: &SceneCollection) -> EoResult<()> {
    let blob = dump_series(series)?;
    log::info!(
        "writing {} scenes ({} bytes) to {}",
        series.len(),
        blob.len(),
        path.as_ref().display()
    );
    std::fs::write(path, blob)?;
    Ok(())
}

/// Read a series blob from disk
pub fn read_series<P: AsRef<Path>>(path: P) -> EoResult<SceneCollection> {
    log::info!("reading scene collection from {}", path.as_ref().display());
    let blob = std::fs::read(path)?;
    load_series(&blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_series_roundtrip() {
        let blob = dump_series(&SceneCollection::new()).unwrap();
        let restored = load_series(&blob).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_garbage_is_persistence_error() {
        assert!(matches!(
            load_series(b"not a gzip blob"),
            Err(EoError::Persistence(_))
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let document = serde_json::json!({"version": 99, "series": []});
        let json = serde_json::to_vec(&document).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).unwrap();
        let blob = encoder.finish().unwrap();
        let result = load_series(&blob);
        match result {
            Err(EoError::Persistence(msg)) => assert!(msg.contains("version 99")),
            other => panic!("expected version error, got {:?}", other.map(|s| s.len())),
        }
    }
}
