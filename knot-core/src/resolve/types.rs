use crate::ident::{Descriptor, DescriptorHash, LocatorHash, Package};
use crate::{KnotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The resolved dependency graph: four co-indexed, hash-keyed tables.
///
/// Packages reference each other only through hashes, never through
/// owned pointers, so cyclic dependency chains need no special
/// treatment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResolutionGraph {
    /// Every descriptor encountered during resolution.
    pub descriptors: BTreeMap<DescriptorHash, Descriptor>,
    /// The locator chosen for each descriptor.
    pub resolutions: BTreeMap<DescriptorHash, LocatorHash>,
    /// Full package data for each chosen locator.
    pub packages: BTreeMap<LocatorHash, Package>,
    /// Locators reachable from the workspace roots once virtualization
    /// has been applied.
    pub accessible: BTreeSet<LocatorHash>,
    /// Locators reachable only through optional dependency edges; their
    /// build failures are tolerated.
    pub optional_builds: BTreeSet<LocatorHash>,
}

impl ResolutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The locator a descriptor resolved to. Missing entries are a
    /// programming error, not a user-recoverable condition.
    pub fn resolution_of(&self, hash: &DescriptorHash) -> Result<&LocatorHash> {
        self.resolutions
            .get(hash)
            .ok_or_else(|| self.missing(hash, "resolutions"))
    }

    pub fn package_of(&self, hash: &LocatorHash) -> Result<&Package> {
        self.packages.get(hash).ok_or_else(|| KnotError::GraphInvariant {
            reason: format!("locator {hash} has no entry in the packages table"),
        })
    }

    pub fn package_for_descriptor(&self, hash: &DescriptorHash) -> Result<&Package> {
        let locator_hash = self.resolution_of(hash)?;
        self.package_of(locator_hash)
    }

    /// Cross-checks the tables: every resolution must point at a stored
    /// package, and every dependency of a stored package must itself be
    /// a known descriptor.
    pub fn assert_consistent(&self) -> Result<()> {
        for (descriptor_hash, locator_hash) in self.resolutions.iter() {
            if !self.packages.contains_key(locator_hash) {
                return Err(KnotError::GraphInvariant {
                    reason: format!(
                        "descriptor {descriptor_hash} resolves to {locator_hash}, which has no package entry"
                    ),
                });
            }
        }

        for package in self.packages.values() {
            for dependency in package.dependencies.values() {
                if !self.descriptors.contains_key(dependency.hash()) {
                    return Err(KnotError::GraphInvariant {
                        reason: format!(
                            "dependency {dependency} of {} is not in the descriptors table",
                            package.locator
                        ),
                    });
                }
            }
        }

        Ok(())
    }

    fn missing(&self, hash: &DescriptorHash, table: &str) -> KnotError {
        let request = self
            .descriptors
            .get(hash)
            .map(|descriptor| descriptor.to_string())
            .unwrap_or_else(|| hash.to_string());

        KnotError::GraphInvariant {
            reason: format!("{request} has no entry in the {table} table"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{Ident, Locator};

    #[test]
    fn consistency_check_spots_dangling_resolution() {
        let mut graph = ResolutionGraph::new();

        let descriptor = Descriptor::new(Ident::new(None, "left-pad"), "^1.0.0");
        let locator = Locator::new(Ident::new(None, "left-pad"), "npm:1.3.0");

        graph
            .descriptors
            .insert(descriptor.hash().clone(), descriptor.clone());
        graph
            .resolutions
            .insert(descriptor.hash().clone(), locator.hash().clone());

        assert!(graph.assert_consistent().is_err());

        graph
            .packages
            .insert(locator.hash().clone(), Package::new(locator));
        assert!(graph.assert_consistent().is_ok());
    }

    #[test]
    fn missing_lookup_is_an_invariant_error() {
        let graph = ResolutionGraph::new();
        let descriptor = Descriptor::new(Ident::new(None, "react"), "^18.0.0");

        let error = graph.resolution_of(descriptor.hash()).unwrap_err();
        assert!(matches!(error, KnotError::GraphInvariant { .. }));
    }
}
