use crate::ident::{Descriptor, DescriptorHash, Locator, Package};
use crate::resolver::{ResolveContext, Resolver};
use crate::{KnotError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Composite resolver: probes each inner resolver's `supports_*`
/// predicate in registration order and delegates to the first match.
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        ResolverChain { resolvers }
    }

    fn for_descriptor(
        &self,
        descriptor: &Descriptor,
        context: &ResolveContext,
    ) -> Result<&Arc<dyn Resolver>> {
        self.resolvers
            .iter()
            .find(|resolver| resolver.supports_descriptor(descriptor, context))
            .ok_or_else(|| KnotError::NoResolverFound {
                request: descriptor.to_string(),
            })
    }

    fn for_locator(
        &self,
        locator: &Locator,
        context: &ResolveContext,
    ) -> Result<&Arc<dyn Resolver>> {
        self.resolvers
            .iter()
            .find(|resolver| resolver.supports_locator(locator, context))
            .ok_or_else(|| KnotError::NoResolverFound {
                request: locator.to_string(),
            })
    }
}

#[async_trait]
impl Resolver for ResolverChain {
    fn supports_descriptor(&self, descriptor: &Descriptor, context: &ResolveContext) -> bool {
        self.resolvers
            .iter()
            .any(|resolver| resolver.supports_descriptor(descriptor, context))
    }

    fn supports_locator(&self, locator: &Locator, context: &ResolveContext) -> bool {
        self.resolvers
            .iter()
            .any(|resolver| resolver.supports_locator(locator, context))
    }

    fn should_persist_resolution(&self, locator: &Locator, context: &ResolveContext) -> bool {
        match self.for_locator(locator, context) {
            Ok(resolver) => resolver.should_persist_resolution(locator, context),
            Err(_) => true,
        }
    }

    fn bind_descriptor(
        &self,
        descriptor: Descriptor,
        parent: &Locator,
        context: &ResolveContext,
    ) -> Descriptor {
        match self.for_descriptor(&descriptor, context) {
            Ok(resolver) => resolver.bind_descriptor(descriptor, parent, context),
            Err(_) => descriptor,
        }
    }

    fn get_resolution_dependencies(
        &self,
        descriptor: &Descriptor,
        context: &ResolveContext,
    ) -> Vec<Descriptor> {
        match self.for_descriptor(descriptor, context) {
            Ok(resolver) => resolver.get_resolution_dependencies(descriptor, context),
            Err(_) => Vec::new(),
        }
    }

    async fn get_candidates(
        &self,
        descriptor: &Descriptor,
        dependencies: &BTreeMap<DescriptorHash, Package>,
        context: &ResolveContext,
    ) -> Result<Vec<Locator>> {
        self.for_descriptor(descriptor, context)?
            .get_candidates(descriptor, dependencies, context)
            .await
    }

    async fn get_satisfying(
        &self,
        descriptor: &Descriptor,
        references: &[String],
        context: &ResolveContext,
    ) -> Result<Option<Vec<Locator>>> {
        self.for_descriptor(descriptor, context)?
            .get_satisfying(descriptor, references, context)
            .await
    }

    async fn resolve(&self, locator: &Locator, context: &ResolveContext) -> Result<Package> {
        self.for_locator(locator, context)?
            .resolve(locator, context)
            .await
    }
}
