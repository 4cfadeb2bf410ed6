use crate::ident::{Descriptor, DescriptorHash, Locator, Package};
use crate::resolver::{ResolveContext, Resolver};
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Claims bare semver ranges and bare tags (requests with no explicit
/// protocol), prefixes the project's default protocol, forwards to the
/// real resolver, then strips the synthetic protocol from the result so
/// callers never see it.
pub struct ProtocolResolver {
    inner: Arc<dyn Resolver>,
}

impl ProtocolResolver {
    pub fn new(inner: Arc<dyn Resolver>) -> Self {
        ProtocolResolver { inner }
    }

    fn qualify(&self, bare: &str, context: &ResolveContext) -> String {
        format!("{}{}", context.config.default_protocol, bare)
    }

    fn unqualify<'a>(&self, reference: &'a str, context: &ResolveContext) -> &'a str {
        reference
            .strip_prefix(context.config.default_protocol.as_str())
            .unwrap_or(reference)
    }
}

fn has_protocol(range: &str) -> bool {
    let Some(colon) = range.find(':') else {
        return false;
    };

    let prefix = &range[..colon];
    !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '+' || c == '-')
}

fn is_bare_tag(range: &str) -> bool {
    !range.is_empty()
        && range
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        && !range.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn is_bare_request(range: &str) -> bool {
    if has_protocol(range) {
        return false;
    }

    knot_semver::is_valid_range(range) || is_bare_tag(range)
}

#[async_trait]
impl Resolver for ProtocolResolver {
    fn supports_descriptor(&self, descriptor: &Descriptor, _context: &ResolveContext) -> bool {
        is_bare_request(descriptor.range())
    }

    fn supports_locator(&self, locator: &Locator, _context: &ResolveContext) -> bool {
        !has_protocol(locator.reference()) && !locator.is_virtual()
    }

    fn bind_descriptor(
        &self,
        descriptor: Descriptor,
        parent: &Locator,
        context: &ResolveContext,
    ) -> Descriptor {
        let qualified = descriptor.with_range(&self.qualify(descriptor.range(), context));
        let bound = self.inner.bind_descriptor(qualified, parent, context);
        bound.with_range(self.unqualify(bound.range(), context))
    }

    async fn get_candidates(
        &self,
        descriptor: &Descriptor,
        dependencies: &BTreeMap<DescriptorHash, Package>,
        context: &ResolveContext,
    ) -> Result<Vec<Locator>> {
        let qualified = descriptor.with_range(&self.qualify(descriptor.range(), context));

        let candidates = self
            .inner
            .get_candidates(&qualified, dependencies, context)
            .await?;

        Ok(candidates
            .into_iter()
            .map(|locator| {
                let bare = self.unqualify(locator.reference(), context).to_string();
                locator.with_reference(&bare)
            })
            .collect())
    }

    async fn get_satisfying(
        &self,
        descriptor: &Descriptor,
        references: &[String],
        context: &ResolveContext,
    ) -> Result<Option<Vec<Locator>>> {
        let qualified = descriptor.with_range(&self.qualify(descriptor.range(), context));

        let satisfying = self
            .inner
            .get_satisfying(&qualified, references, context)
            .await?;

        Ok(satisfying.map(|locators| {
            locators
                .into_iter()
                .map(|locator| {
                    let bare = self.unqualify(locator.reference(), context).to_string();
                    locator.with_reference(&bare)
                })
                .collect()
        }))
    }

    async fn resolve(&self, locator: &Locator, context: &ResolveContext) -> Result<Package> {
        let qualified = locator.with_reference(&self.qualify(locator.reference(), context));
        let package = self.inner.resolve(&qualified, context).await?;
        Ok(package.renamed(locator.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_protocol_prefixes() {
        assert!(has_protocol("npm:^1.0.0"));
        assert!(has_protocol("workspace:*"));
        assert!(has_protocol("git+ssh://host/repo"));
        assert!(!has_protocol("^1.0.0"));
        assert!(!has_protocol("latest"));
        assert!(!has_protocol(">=1.0.0 <2.0.0"));
    }

    #[test]
    fn classifies_bare_requests() {
        assert!(is_bare_request("^1.2.3"));
        assert!(is_bare_request("latest"));
        assert!(is_bare_request("next"));
        assert!(is_bare_request("*"));
        assert!(!is_bare_request("npm:^1.2.3"));
        assert!(!is_bare_request("workspace:packages/web"));
    }
}
