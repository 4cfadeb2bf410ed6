use crate::ident::LocatorHash;
use crate::resolve::ResolutionGraph;
use crate::{KnotError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

/// Snapshot of a completed install, written next to the project so the
/// next run can skip straight to linking when nothing changed. Tied to
/// the exact lockfile contents through a fingerprint.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstallState {
    pub lockfile_fingerprint: String,
    pub graph: ResolutionGraph,
    pub checksums: BTreeMap<LocatorHash, String>,
}

pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl InstallState {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| KnotError::WriteFile {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let encoded = bincode::serialize(self).map_err(|source| KnotError::StateEncode {
            reason: source.to_string(),
        })?;

        let file = fs::File::create(path).map_err(|source| KnotError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;

        let mut encoder =
            flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder
            .write_all(&encoded)
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|source| KnotError::WriteFile {
                path: path.to_path_buf(),
                source,
            })
    }

    /// A missing snapshot is not an error; a corrupt one is, so the
    /// caller can surface it rather than silently re-resolving.
    pub fn load(path: &Path) -> Result<Option<InstallState>> {
        if !path.is_file() {
            return Ok(None);
        }

        let file = fs::File::open(path).map_err(|source| KnotError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut encoded = Vec::new();
        decoder
            .read_to_end(&mut encoded)
            .map_err(|source| KnotError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;

        let state = bincode::deserialize(&encoded).map_err(|source| KnotError::StateDecode {
            path: path.to_path_buf(),
            reason: source.to_string(),
        })?;

        Ok(Some(state))
    }

    /// Whether this snapshot still describes the given lockfile bytes.
    pub fn matches(&self, lockfile_data: &[u8]) -> bool {
        self.lockfile_fingerprint == fingerprint(lockfile_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{Ident, Locator, Package};

    fn sample_state() -> InstallState {
        let mut graph = ResolutionGraph::new();
        let locator = Locator::new(Ident::new(Some("scope"), "pkg"), "npm:1.2.3");
        graph.accessible.insert(locator.hash().clone());
        graph
            .packages
            .insert(locator.hash().clone(), Package::new(locator.clone()));

        let mut checksums = BTreeMap::new();
        checksums.insert(locator.hash().clone(), "1/deadbeef".to_string());

        InstallState {
            lockfile_fingerprint: fingerprint(b"lock contents"),
            graph,
            checksums,
        }
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".knot/install-state.bin");

        let state = sample_state();
        state.save(&path).unwrap();

        let loaded = InstallState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.lockfile_fingerprint, state.lockfile_fingerprint);
        assert_eq!(loaded.graph.packages.len(), 1);
        assert_eq!(loaded.checksums, state.checksums);
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InstallState::load(&dir.path().join("absent.bin"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        fs::write(&path, b"not gzip at all").unwrap();

        assert!(InstallState::load(&path).is_err());
    }

    #[test]
    fn fingerprint_tracks_lockfile_contents() {
        let state = sample_state();
        assert!(state.matches(b"lock contents"));
        assert!(!state.matches(b"different contents"));
    }
}
