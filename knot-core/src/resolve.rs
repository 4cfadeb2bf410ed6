use crate::ident::{Descriptor, DescriptorHash, Locator, LocatorHash, Package};
use crate::resolver::{ResolveContext, Resolver};
use crate::{KnotError, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub mod peers;
pub mod types;

pub use types::ResolutionGraph;

/// Hook applied to every dependency descriptor before it is scheduled;
/// lets callers substitute user-specified replacements.
pub type DependencyReducer = Arc<dyn Fn(&Locator, Descriptor) -> Descriptor + Send + Sync>;

#[derive(Default)]
pub struct ResolveOptions {
    /// Requests that must resolve as if they were a different request.
    pub aliases: BTreeMap<DescriptorHash, Descriptor>,
    pub reducer: Option<DependencyReducer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitState {
    Scheduled,
    Resolving,
    Resolved,
}

#[derive(Clone, Debug)]
enum WorkUnit {
    ResolveDescriptor(DescriptorHash),
    ResolvePackage(LocatorHash),
}

struct Engine<'a> {
    resolver: &'a dyn Resolver,
    context: &'a ResolveContext,
    options: &'a ResolveOptions,
    graph: ResolutionGraph,
    descriptor_state: BTreeMap<DescriptorHash, UnitState>,
    package_state: BTreeMap<LocatorHash, UnitState>,
    pending_locators: BTreeMap<LocatorHash, Locator>,
    frontier: VecDeque<WorkUnit>,
    scheduled_new_work: bool,
}

enum UnitOutcome {
    Candidates(DescriptorHash, Vec<Locator>),
    Resolved(LocatorHash, Package),
}

impl<'a> Engine<'a> {
    fn new(
        resolver: &'a dyn Resolver,
        context: &'a ResolveContext,
        options: &'a ResolveOptions,
    ) -> Self {
        Engine {
            resolver,
            context,
            options,
            graph: ResolutionGraph::new(),
            descriptor_state: BTreeMap::new(),
            package_state: BTreeMap::new(),
            pending_locators: BTreeMap::new(),
            frontier: VecDeque::new(),
            scheduled_new_work: false,
        }
    }

    /// Schedules a descriptor unless it was already claimed. The
    /// descriptor is recorded immediately so re-entrant scheduling sees
    /// it taken.
    fn schedule_descriptor(&mut self, descriptor: Descriptor) -> bool {
        let hash = descriptor.hash().clone();

        if self.descriptor_state.contains_key(&hash) {
            return false;
        }

        self.descriptor_state.insert(hash.clone(), UnitState::Scheduled);
        self.graph.descriptors.insert(hash.clone(), descriptor);
        self.frontier.push_back(WorkUnit::ResolveDescriptor(hash));
        self.scheduled_new_work = true;
        true
    }

    fn schedule_package(&mut self, locator: Locator) -> bool {
        let hash = locator.hash().clone();

        if self.package_state.contains_key(&hash) {
            return false;
        }

        self.package_state.insert(hash.clone(), UnitState::Scheduled);
        self.pending_locators.insert(hash.clone(), locator);
        self.frontier.push_back(WorkUnit::ResolvePackage(hash));
        self.scheduled_new_work = true;
        true
    }

    fn descriptor_resolved(&self, hash: &DescriptorHash) -> bool {
        self.descriptor_state
            .get(hash)
            .is_some_and(|state| *state == UnitState::Resolved)
    }

    /// Decides whether a descriptor unit can run now. Returns the
    /// resolution dependencies' packages when ready, or `None` when the
    /// unit must wait for prerequisites scheduled in the meantime.
    fn prepare_descriptor(
        &mut self,
        hash: &DescriptorHash,
    ) -> Result<Option<(Descriptor, BTreeMap<DescriptorHash, Package>)>> {
        // A registered alias means this request resolves as if it were
        // the alias; adopt the alias's result once it lands.
        if let Some(alias) = self.options.aliases.get(hash).cloned() {
            if self.descriptor_resolved(alias.hash()) {
                let locator_hash = self.graph.resolutions.get(alias.hash()).cloned();
                if let Some(locator_hash) = locator_hash {
                    self.graph.resolutions.insert(hash.clone(), locator_hash);
                    self.descriptor_state.insert(hash.clone(), UnitState::Resolved);
                }
                return Ok(None);
            }

            self.schedule_descriptor(alias);
            self.frontier
                .push_back(WorkUnit::ResolveDescriptor(hash.clone()));
            return Ok(None);
        }

        let descriptor = self
            .graph
            .descriptors
            .get(hash)
            .cloned()
            .ok_or_else(|| KnotError::GraphInvariant {
                reason: format!("scheduled descriptor {hash} vanished from the table"),
            })?;

        let prerequisites = self
            .resolver
            .get_resolution_dependencies(&descriptor, self.context);

        let mut resolved = BTreeMap::new();
        let mut waiting = false;

        for prerequisite in prerequisites {
            if self.descriptor_resolved(prerequisite.hash()) {
                let package = self.graph.package_for_descriptor(prerequisite.hash())?;
                resolved.insert(prerequisite.hash().clone(), package.clone());
            } else {
                self.schedule_descriptor(prerequisite);
                waiting = true;
            }
        }

        if waiting {
            self.frontier
                .push_back(WorkUnit::ResolveDescriptor(hash.clone()));
            return Ok(None);
        }

        self.descriptor_state.insert(hash.clone(), UnitState::Resolving);
        Ok(Some((descriptor, resolved)))
    }

    fn apply_candidates(
        &mut self,
        hash: DescriptorHash,
        candidates: Vec<Locator>,
    ) -> Result<()> {
        let descriptor = &self.graph.descriptors[&hash];

        let chosen = candidates
            .into_iter()
            .next()
            .ok_or_else(|| KnotError::NoCandidates {
                descriptor: descriptor.to_string(),
            })?;

        self.graph
            .resolutions
            .insert(hash.clone(), chosen.hash().clone());
        self.descriptor_state.insert(hash, UnitState::Resolved);
        self.schedule_package(chosen);
        Ok(())
    }

    fn apply_package(&mut self, hash: LocatorHash, package: Package) -> Result<()> {
        let requested = &self.pending_locators[&hash];

        // A resolver is forbidden to change locator identity while
        // hydrating a package.
        if package.locator != *requested {
            return Err(KnotError::ResolverChangedLocator {
                expected: requested.to_string(),
                actual: package.locator.to_string(),
            });
        }

        let mut package = self.normalize(package);

        let mut bound = BTreeMap::new();
        for descriptor in std::mem::take(&mut package.dependencies).into_values() {
            let descriptor = match &self.options.reducer {
                Some(reducer) => reducer(&package.locator, descriptor),
                None => descriptor,
            };

            let descriptor =
                self.resolver
                    .bind_descriptor(descriptor, &package.locator, self.context);

            bound.insert(descriptor.ident().hash().clone(), descriptor.clone());
            self.schedule_descriptor(descriptor);
        }
        package.dependencies = bound;

        self.package_state.insert(hash.clone(), UnitState::Resolved);
        self.graph.packages.insert(hash, package);
        Ok(())
    }

    /// Applies package extensions: they may only add dependencies or
    /// peer requests that are currently absent, never replace existing
    /// ones.
    fn normalize(&self, mut package: Package) -> Package {
        let Some(extension) = self
            .context
            .extensions
            .get(package.locator.ident().hash())
        else {
            return package;
        };

        for dependency in extension.dependencies.iter() {
            package
                .dependencies
                .entry(dependency.ident().hash().clone())
                .or_insert_with(|| dependency.clone());
        }

        for peer in extension.peer_dependencies.iter() {
            package
                .peer_dependencies
                .entry(peer.ident().hash().clone())
                .or_insert_with(|| peer.clone());
        }

        package
    }

    async fn run(mut self, roots: &[Descriptor]) -> Result<ResolutionGraph> {
        for root in roots {
            self.schedule_descriptor(root.clone());
        }

        loop {
            let batch: Vec<WorkUnit> = self.frontier.drain(..).collect();
            if batch.is_empty() {
                break;
            }

            let mut descriptor_units = Vec::new();
            let mut package_units = Vec::new();
            let mut progressed = false;
            self.scheduled_new_work = false;

            for unit in batch {
                match unit {
                    WorkUnit::ResolveDescriptor(hash) => {
                        if self.descriptor_resolved(&hash) {
                            progressed = true;
                            continue;
                        }

                        match self.prepare_descriptor(&hash)? {
                            Some((descriptor, dependencies)) => {
                                descriptor_units.push((hash, descriptor, dependencies));
                            }
                            None => {
                                // Either adopted an alias result or
                                // requeued behind prerequisites.
                                if self.descriptor_resolved(&hash) {
                                    progressed = true;
                                }
                            }
                        }
                    }
                    WorkUnit::ResolvePackage(hash) => {
                        self.package_state.insert(hash.clone(), UnitState::Resolving);
                        let locator = self.pending_locators[&hash].clone();
                        package_units.push((hash, locator));
                    }
                }
            }

            let resolver = self.resolver;
            let context = self.context;

            let descriptor_futures = descriptor_units.into_iter().map(
                move |(hash, descriptor, dependencies)| async move {
                    let candidates = resolver
                        .get_candidates(&descriptor, &dependencies, context)
                        .await
                        .map_err(|error| error.in_context(descriptor.to_string()))?;
                    Ok::<_, KnotError>(UnitOutcome::Candidates(hash, candidates))
                },
            );

            let package_futures = package_units.into_iter().map(move |(hash, locator)| {
                async move {
                    let package = resolver
                        .resolve(&locator, context)
                        .await
                        .map_err(|error| error.in_context(locator.to_string()))?;
                    Ok::<_, KnotError>(UnitOutcome::Resolved(hash, package))
                }
            });

            let outcomes = futures::future::join_all(
                descriptor_futures
                    .map(futures::future::Either::Left)
                    .chain(package_futures.map(futures::future::Either::Right)),
            )
            .await;

            for outcome in outcomes {
                match outcome? {
                    UnitOutcome::Candidates(hash, candidates) => {
                        self.apply_candidates(hash, candidates)?;
                    }
                    UnitOutcome::Resolved(hash, package) => {
                        self.apply_package(hash, package)?;
                    }
                }
                progressed = true;
            }

            if !progressed && !self.scheduled_new_work && !self.frontier.is_empty() {
                return Err(KnotError::GraphInvariant {
                    reason: "resolution stalled: alias or resolution-dependency cycle".to_string(),
                });
            }
        }

        self.graph.assert_consistent()?;
        Ok(self.graph)
    }
}

/// Resolves every root request into a full package graph. All-or-
/// nothing: any resolver failure aborts the pass and discards partial
/// results.
pub async fn resolve_everything(
    roots: &[Descriptor],
    resolver: &dyn Resolver,
    context: &ResolveContext,
    options: &ResolveOptions,
) -> Result<ResolutionGraph> {
    Engine::new(resolver, context, options).run(roots).await
}
