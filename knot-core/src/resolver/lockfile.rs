use crate::ident::{Descriptor, DescriptorHash, Locator, Package};
use crate::resolver::{ResolveContext, Resolver};
use crate::{KnotError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Serves resolutions recorded by a prior run without any computation,
/// so unchanged requests resolve identically across installs.
pub struct LockfileResolver;

#[async_trait]
impl Resolver for LockfileResolver {
    fn supports_descriptor(&self, descriptor: &Descriptor, context: &ResolveContext) -> bool {
        match context.stored.resolutions.get(descriptor.hash()) {
            Some(locator_hash) => context.stored.packages.contains_key(locator_hash),
            None => false,
        }
    }

    fn supports_locator(&self, locator: &Locator, context: &ResolveContext) -> bool {
        context.stored.packages.contains_key(locator.hash())
    }

    async fn get_candidates(
        &self,
        descriptor: &Descriptor,
        _dependencies: &BTreeMap<DescriptorHash, Package>,
        context: &ResolveContext,
    ) -> Result<Vec<Locator>> {
        let locator_hash = context
            .stored
            .resolutions
            .get(descriptor.hash())
            .ok_or_else(|| KnotError::NoCandidates {
                descriptor: descriptor.to_string(),
            })?;

        let package =
            context
                .stored
                .packages
                .get(locator_hash)
                .ok_or_else(|| KnotError::NoCandidates {
                    descriptor: descriptor.to_string(),
                })?;

        Ok(vec![package.locator.clone()])
    }

    async fn resolve(&self, locator: &Locator, context: &ResolveContext) -> Result<Package> {
        context
            .stored
            .packages
            .get(locator.hash())
            .cloned()
            .ok_or_else(|| KnotError::GraphInvariant {
                reason: format!("lockfile resolver asked about unknown locator {locator}"),
            })
    }
}
