use crate::ident::{make_hash, Descriptor, DescriptorHash, IdentHash, Locator, LocatorHash};
use crate::resolve::types::ResolutionGraph;
use crate::{KnotError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Upper bound on how many times one physical package may appear on
/// the virtualization stack before we declare the graph unsatisfiable
/// (e.g. mutually peer-dependent packages with no stable fixpoint).
pub const MAX_VIRTUAL_DEPTH: usize = 1000;

/// Range of the sentinel descriptor standing in for a peer request
/// nothing provided. Participates in the dedup hash, stripped before
/// the graph is published.
pub const MISSING_RANGE: &str = "missing:";

/// Peer problems are reported, never fatal: the install still succeeds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerWarning {
    NotProvided {
        subject: LocatorHash,
        requester: String,
        peer: String,
        parent: String,
    },
    Mismatch {
        subject: LocatorHash,
        requester: String,
        peer: String,
        range: String,
        provided: String,
    },
}

impl PeerWarning {
    fn subject(&self) -> &LocatorHash {
        match self {
            PeerWarning::NotProvided { subject, .. } => subject,
            PeerWarning::Mismatch { subject, .. } => subject,
        }
    }
}

impl fmt::Display for PeerWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerWarning::NotProvided {
                requester,
                peer,
                parent,
                ..
            } => write!(
                f,
                "{requester} requests peer dependency {peer}, but {parent} does not provide it"
            ),
            PeerWarning::Mismatch {
                requester,
                peer,
                range,
                provided,
                ..
            } => write!(
                f,
                "{requester} requests {peer} at {range}, but its context provides {provided}"
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct VirtualizationReport {
    pub warnings: Vec<PeerWarning>,
}

/// Clones every package that declares peer dependencies once per
/// dependent context, wires each peer request to whatever the context
/// provides, then collapses clones that end up structurally identical.
pub fn apply_virtual_resolutions(
    graph: &mut ResolutionGraph,
    roots: &[Locator],
) -> Result<VirtualizationReport> {
    apply_with_limit(graph, roots, MAX_VIRTUAL_DEPTH)
}

fn apply_with_limit(
    graph: &mut ResolutionGraph,
    roots: &[Locator],
    depth_limit: usize,
) -> Result<VirtualizationReport> {
    let mut state = Virtualizer {
        graph,
        depth_limit,
        virtual_stack: BTreeMap::new(),
        resolution_stack: Vec::new(),
        visited: BTreeSet::new(),
        accessible: BTreeSet::new(),
        optional_visits: BTreeSet::new(),
        non_optional: BTreeSet::new(),
        virtual_groups: BTreeMap::new(),
        warnings: Vec::new(),
    };

    for root in roots {
        state.visit(root.hash().clone(), true, false)?;
    }

    state.dedup_virtuals();
    state.strip_missing_markers();

    let Virtualizer {
        accessible,
        optional_visits,
        non_optional,
        warnings,
        ..
    } = state;

    let optional_builds: BTreeSet<LocatorHash> = optional_visits
        .difference(&non_optional)
        .cloned()
        .collect();

    let warnings = warnings
        .into_iter()
        .filter(|warning| graph.packages.contains_key(warning.subject()))
        .collect();

    graph.accessible = accessible
        .into_iter()
        .filter(|hash| graph.packages.contains_key(hash))
        .collect();
    graph.optional_builds = optional_builds
        .into_iter()
        .filter(|hash| graph.packages.contains_key(hash))
        .collect();

    Ok(VirtualizationReport { warnings })
}

struct Virtualizer<'g> {
    graph: &'g mut ResolutionGraph,
    depth_limit: usize,
    /// Per-physical-package recursion counters; distinguishes a package
    /// legitimately appearing at several depths from a true cycle.
    virtual_stack: BTreeMap<LocatorHash, usize>,
    resolution_stack: Vec<String>,
    visited: BTreeSet<(LocatorHash, bool)>,
    accessible: BTreeSet<LocatorHash>,
    optional_visits: BTreeSet<LocatorHash>,
    non_optional: BTreeSet<LocatorHash>,
    /// Virtual descriptors grouped by the physical package they clone,
    /// for the dedup pass.
    virtual_groups: BTreeMap<LocatorHash, BTreeSet<DescriptorHash>>,
    warnings: Vec<PeerWarning>,
}

impl Virtualizer<'_> {
    fn visit(&mut self, parent_hash: LocatorHash, first: bool, optional: bool) -> Result<()> {
        let parent = self.graph.package_of(&parent_hash)?.clone();
        let physical_hash = parent.locator.devirtualize().hash().clone();

        let depth = self
            .virtual_stack
            .get(&physical_hash)
            .copied()
            .unwrap_or(0);
        if depth >= self.depth_limit {
            let dump_path = self.dump_resolution_stack(&parent.locator)?;
            return Err(KnotError::VirtualDepthExceeded {
                locator: parent.locator.to_string(),
                dump_path,
            });
        }

        self.accessible.insert(parent_hash.clone());
        if optional {
            self.optional_visits.insert(parent_hash.clone());
        } else {
            self.non_optional.insert(parent_hash.clone());
        }

        if !self.visited.insert((parent_hash.clone(), optional)) {
            return Ok(());
        }

        self.resolution_stack.push(parent.locator.to_string());

        let outcome = self.visit_children(&parent_hash, &parent, first, optional);

        self.resolution_stack.pop();
        outcome
    }

    fn visit_children(
        &mut self,
        parent_hash: &LocatorHash,
        parent: &crate::ident::Package,
        first: bool,
        optional: bool,
    ) -> Result<()> {
        struct Child {
            resolution: LocatorHash,
            optional: bool,
            virtualized: bool,
        }

        let mut spliced = parent.dependencies.clone();
        let mut children = Vec::new();

        // First pass: clone every dependency that declares peers, keyed
        // by this parent's identity as entropy, and splice the virtual
        // descriptor in place of the original.
        for (ident_hash, descriptor) in parent.dependencies.iter() {
            // Below the top level, a dependency that is also one of the
            // parent's own peer requests is provided by the consumer;
            // it will be wired by the grandparent instead.
            if !first && parent.peer_dependencies.contains_key(ident_hash) {
                continue;
            }

            let child_optional = optional
                || parent.dependency_is_optional(descriptor.ident());

            let resolution = self.graph.resolution_of(descriptor.hash())?.clone();
            let child = self.graph.package_of(&resolution)?.clone();

            if child.peer_dependencies.is_empty() {
                children.push(Child {
                    resolution,
                    optional: child_optional,
                    virtualized: false,
                });
                continue;
            }

            let entropy = parent_hash.as_str();
            let virtual_descriptor = descriptor.virtualize(entropy);
            let virtual_package = child.virtualize(entropy);
            let virtual_hash = virtual_package.hash().clone();

            self.graph
                .descriptors
                .insert(virtual_descriptor.hash().clone(), virtual_descriptor.clone());
            self.graph
                .resolutions
                .insert(virtual_descriptor.hash().clone(), virtual_hash.clone());
            self.graph
                .packages
                .insert(virtual_hash.clone(), virtual_package);

            self.virtual_groups
                .entry(child.locator.hash().clone())
                .or_default()
                .insert(virtual_descriptor.hash().clone());

            spliced.insert(ident_hash.clone(), virtual_descriptor);

            children.push(Child {
                resolution: virtual_hash,
                optional: child_optional,
                virtualized: true,
            });
        }

        if let Some(stored) = self.graph.packages.get_mut(parent_hash) {
            stored.dependencies = spliced.clone();
        }

        // Second pass: wire each clone's peer requests to whatever the
        // parent context provides.
        for child in children.iter().filter(|child| child.virtualized) {
            self.wire_peers(parent_hash, parent, &spliced, &child.resolution)?;
        }

        // Third pass: recurse, counting how deep each physical package
        // is on the virtualization stack.
        for child in children {
            if child.virtualized {
                let physical = self
                    .graph
                    .package_of(&child.resolution)?
                    .locator
                    .devirtualize()
                    .hash()
                    .clone();

                *self.virtual_stack.entry(physical.clone()).or_insert(0) += 1;
                let outcome = self.visit(child.resolution, false, child.optional);
                *self.virtual_stack.entry(physical).or_insert(1) -= 1;
                outcome?;
            } else {
                self.visit(child.resolution, false, child.optional)?;
            }
        }

        Ok(())
    }

    fn wire_peers(
        &mut self,
        parent_hash: &LocatorHash,
        parent: &crate::ident::Package,
        parent_dependencies: &BTreeMap<IdentHash, Descriptor>,
        virtual_hash: &LocatorHash,
    ) -> Result<()> {
        let mut virtual_package = self.graph.package_of(virtual_hash)?.clone();
        let requester = virtual_package.locator.devirtualize().to_string();

        for (peer_ident_hash, peer_request) in virtual_package.peer_dependencies.clone() {
            let mut provided = parent_dependencies.get(&peer_ident_hash).cloned();

            // A package may peer-depend on its own consumer.
            if provided.is_none() && peer_ident_hash == *parent.locator.ident().hash() {
                let self_reference = parent.locator.as_descriptor();
                self.graph
                    .descriptors
                    .insert(self_reference.hash().clone(), self_reference.clone());
                self.graph
                    .resolutions
                    .insert(self_reference.hash().clone(), parent_hash.clone());
                provided = Some(self_reference);
            }

            match provided {
                Some(provider) => {
                    // Fourth pass bookkeeping: remember who fills each
                    // peer slot so version drift can be reported.
                    if let Some(provider_hash) = self.graph.resolutions.get(provider.hash()) {
                        if let Some(provider_package) = self.graph.packages.get(provider_hash) {
                            if let Some(warning) = peer_mismatch_warning(
                                virtual_hash,
                                &requester,
                                &peer_request,
                                provider_package.version.as_deref(),
                            ) {
                                self.warnings.push(warning);
                            }
                        }
                    }

                    virtual_package
                        .dependencies
                        .insert(peer_ident_hash, provider);
                }
                None => {
                    if virtual_package.peer_is_optional(peer_request.ident()) {
                        continue;
                    }

                    let missing = Descriptor::new(peer_request.ident().clone(), MISSING_RANGE);
                    self.graph
                        .descriptors
                        .insert(missing.hash().clone(), missing.clone());
                    virtual_package.dependencies.insert(peer_ident_hash, missing);

                    self.warnings.push(PeerWarning::NotProvided {
                        subject: virtual_hash.clone(),
                        requester: requester.clone(),
                        peer: peer_request.ident().to_string(),
                        parent: parent.locator.to_string(),
                    });
                }
            }
        }

        self.graph
            .packages
            .insert(virtual_hash.clone(), virtual_package);
        Ok(())
    }

    /// Structural fingerprint of a clone: its originating request plus
    /// the resolution of every dependency (missing peers included).
    fn structural_key(&self, virtual_descriptor_hash: &DescriptorHash) -> Result<String> {
        let descriptor = &self.graph.descriptors[virtual_descriptor_hash];
        let virtual_hash = self.graph.resolution_of(virtual_descriptor_hash)?;
        let package = self.graph.package_of(virtual_hash)?;

        let mut parts: Vec<String> = vec![descriptor.devirtualize().hash().to_string()];

        for (ident_hash, dependency) in package.dependencies.iter() {
            if dependency.range() == MISSING_RANGE {
                parts.push(format!("{ident_hash}={MISSING_RANGE}"));
            } else {
                let resolution = self.graph.resolution_of(dependency.hash())?;
                parts.push(format!("{ident_hash}={resolution}"));
            }
        }

        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        Ok(make_hash(&refs))
    }

    /// Collapses structurally identical clones of the same physical
    /// package, repointing dependents at the surviving one. Runs to a
    /// fixpoint: one merge can make a further pair equal.
    fn dedup_virtuals(&mut self) {
        loop {
            let mut merged_any = false;

            let groups: Vec<(LocatorHash, Vec<DescriptorHash>)> = self
                .virtual_groups
                .iter()
                .map(|(physical, members)| {
                    (physical.clone(), members.iter().cloned().collect())
                })
                .collect();

            for (physical, members) in groups {
                let mut masters: BTreeMap<String, DescriptorHash> = BTreeMap::new();

                for member in members {
                    if !self.graph.descriptors.contains_key(&member) {
                        continue;
                    }

                    let Ok(key) = self.structural_key(&member) else {
                        continue;
                    };

                    match masters.get(&key) {
                        Some(master) => {
                            self.merge_virtual(&physical, master.clone(), member);
                            merged_any = true;
                        }
                        None => {
                            masters.insert(key, member);
                        }
                    }
                }
            }

            if !merged_any {
                break;
            }
        }
    }

    fn merge_virtual(
        &mut self,
        physical: &LocatorHash,
        master: DescriptorHash,
        duplicate: DescriptorHash,
    ) {
        let master_descriptor = self.graph.descriptors[&master].clone();
        let duplicate_locator = self.graph.resolutions.get(&duplicate).cloned();

        for package in self.graph.packages.values_mut() {
            for slot in package.dependencies.values_mut() {
                if *slot.hash() == duplicate {
                    *slot = master_descriptor.clone();
                }
            }
        }

        self.graph.descriptors.remove(&duplicate);
        self.graph.resolutions.remove(&duplicate);

        if let Some(locator_hash) = duplicate_locator {
            self.graph.packages.remove(&locator_hash);
            self.accessible.remove(&locator_hash);
            self.optional_visits.remove(&locator_hash);
            self.non_optional.remove(&locator_hash);
        }

        if let Some(group) = self.virtual_groups.get_mut(physical) {
            group.remove(&duplicate);
        }
    }

    fn strip_missing_markers(&mut self) {
        for package in self.graph.packages.values_mut() {
            package
                .dependencies
                .retain(|_, dependency| dependency.range() != MISSING_RANGE);
        }

        self.graph
            .descriptors
            .retain(|_, descriptor| descriptor.range() != MISSING_RANGE);
    }

    fn dump_resolution_stack(&self, locator: &Locator) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!(
            "knot-virtual-stack-{}.log",
            std::process::id()
        ));

        let mut dump = format!(
            "virtualization depth limit hit while processing {locator}\n\nresolution stack ({} frames):\n",
            self.resolution_stack.len()
        );

        for frame in self.resolution_stack.iter() {
            dump.push_str("  ");
            dump.push_str(frame);
            dump.push('\n');
        }

        std::fs::write(&path, dump).map_err(|source| KnotError::WriteFile {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }
}

fn peer_mismatch_warning(
    subject: &LocatorHash,
    requester: &str,
    peer_request: &Descriptor,
    provided_version: Option<&str>,
) -> Option<PeerWarning> {
    let range = bare_range(peer_request.range());
    let set = knot_semver::RangeSet::parse(range).ok()?;

    let provided = provided_version?;
    let version = knot_semver::Version::parse(provided).ok()?;

    if set.matches(&version) {
        return None;
    }

    Some(PeerWarning::Mismatch {
        subject: subject.clone(),
        requester: requester.to_string(),
        peer: peer_request.ident().to_string(),
        range: peer_request.range().to_string(),
        provided: provided.to_string(),
    })
}

/// Strips a protocol qualifier (`npm:` and friends) off a peer range so
/// it can be matched as plain semver.
fn bare_range(range: &str) -> &str {
    match range.split_once(':') {
        Some((prefix, rest))
            if !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '+' || c == '-') =>
        {
            rest
        }
        _ => range,
    }
}
