use crate::{KnotError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const VIRTUAL_PREFIX: &str = "virtual:";

/// Stable hash over a sequence of semantic fields. Fields are
/// NUL-separated so that `("ab", "c")` and `("a", "bc")` differ.
pub fn make_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();

    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }

    let digest = hasher.finalize();
    let mut hash = hex::encode(digest);
    hash.truncate(32);
    hash
}

macro_rules! hash_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

hash_newtype!(IdentHash);
hash_newtype!(DescriptorHash);
hash_newtype!(LocatorHash);

/// A package family: scope + name, independent of any version.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct Ident {
    ident_hash: IdentHash,
    scope: Option<String>,
    name: String,
}

impl Ident {
    pub fn new(scope: Option<&str>, name: &str) -> Self {
        let scope = scope.map(|value| value.to_string());
        let ident_hash = IdentHash(make_hash(&[scope.as_deref().unwrap_or(""), name]));

        Ident {
            ident_hash,
            scope,
            name: name.to_string(),
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        if let Some(rest) = input.strip_prefix('@') {
            let (scope, name) = rest
                .split_once('/')
                .ok_or_else(|| KnotError::BadDescriptor {
                    input: input.to_string(),
                })?;

            if scope.is_empty() || name.is_empty() {
                return Err(KnotError::BadDescriptor {
                    input: input.to_string(),
                });
            }

            Ok(Ident::new(Some(scope), name))
        } else if input.is_empty() || input.contains('/') {
            Err(KnotError::BadDescriptor {
                input: input.to_string(),
            })
        } else {
            Ok(Ident::new(None, input))
        }
    }

    pub fn hash(&self) -> &IdentHash {
        &self.ident_hash
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Ident {
    fn eq(&self, other: &Self) -> bool {
        self.ident_hash == other.ident_hash
    }
}

impl std::hash::Hash for Ident {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ident_hash.hash(state);
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "@{}/{}", scope, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A dependency request: an ident plus an opaque range. The range's
/// grammar belongs to whichever resolver claims it.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    descriptor_hash: DescriptorHash,
    ident: Ident,
    range: String,
}

impl Descriptor {
    pub fn new(ident: Ident, range: &str) -> Self {
        let descriptor_hash = DescriptorHash(make_hash(&[ident.hash().as_str(), range]));

        Descriptor {
            descriptor_hash,
            ident,
            range: range.to_string(),
        }
    }

    /// Parses `name@range` or `@scope/name@range`.
    pub fn parse(input: &str) -> Result<Self> {
        let (ident, range) = split_ident_suffix(input).ok_or_else(|| KnotError::BadDescriptor {
            input: input.to_string(),
        })?;

        Ok(Descriptor::new(Ident::parse(ident)?, range))
    }

    pub fn hash(&self) -> &DescriptorHash {
        &self.descriptor_hash
    }

    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    pub fn range(&self) -> &str {
        &self.range
    }

    pub fn with_range(&self, range: &str) -> Descriptor {
        Descriptor::new(self.ident.clone(), range)
    }

    pub fn is_virtual(&self) -> bool {
        self.range.starts_with(VIRTUAL_PREFIX)
    }

    /// Marks the descriptor as a context-specific clone. The entropy is
    /// the hash of the dependent that required the split.
    pub fn virtualize(&self, entropy: &str) -> Descriptor {
        debug_assert!(!self.is_virtual(), "cannot virtualize twice");
        self.with_range(&format!("{VIRTUAL_PREFIX}{entropy}#{}", self.range))
    }

    pub fn devirtualize(&self) -> Descriptor {
        match strip_virtual(&self.range) {
            Some(inner) => self.with_range(inner),
            None => self.clone(),
        }
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor_hash == other.descriptor_hash
    }
}

impl std::hash::Hash for Descriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.descriptor_hash.hash(state);
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ident, self.range)
    }
}

/// A resolved package identity: an ident plus a concrete reference.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct Locator {
    locator_hash: LocatorHash,
    ident: Ident,
    reference: String,
}

impl Locator {
    pub fn new(ident: Ident, reference: &str) -> Self {
        let locator_hash = LocatorHash(make_hash(&[ident.hash().as_str(), reference]));

        Locator {
            locator_hash,
            ident,
            reference: reference.to_string(),
        }
    }

    /// Parses `name@reference` or `@scope/name@reference`.
    pub fn parse(input: &str) -> Result<Self> {
        let (ident, reference) =
            split_ident_suffix(input).ok_or_else(|| KnotError::BadLocator {
                input: input.to_string(),
            })?;

        let ident = Ident::parse(ident).map_err(|_| KnotError::BadLocator {
            input: input.to_string(),
        })?;

        Ok(Locator::new(ident, reference))
    }

    pub fn hash(&self) -> &LocatorHash {
        &self.locator_hash
    }

    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn with_reference(&self, reference: &str) -> Locator {
        Locator::new(self.ident.clone(), reference)
    }

    pub fn is_virtual(&self) -> bool {
        self.reference.starts_with(VIRTUAL_PREFIX)
    }

    pub fn virtualize(&self, entropy: &str) -> Locator {
        debug_assert!(!self.is_virtual(), "cannot virtualize twice");
        self.with_reference(&format!("{VIRTUAL_PREFIX}{entropy}#{}", self.reference))
    }

    pub fn devirtualize(&self) -> Locator {
        match strip_virtual(&self.reference) {
            Some(inner) => self.with_reference(inner),
            None => self.clone(),
        }
    }

    /// Turns the locator back into the request it trivially satisfies.
    pub fn as_descriptor(&self) -> Descriptor {
        Descriptor::new(self.ident.clone(), &self.reference)
    }

    /// Filesystem-safe, human-readable slug used for cache filenames.
    pub fn slug(&self) -> String {
        let mut slug = String::new();

        if let Some(scope) = self.ident.scope() {
            slug.push_str(scope);
            slug.push('-');
        }

        slug.push_str(self.ident.name());
        slug.push('-');
        slug.push_str(&self.reference);

        slug.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.locator_hash == other.locator_hash
    }
}

impl std::hash::Hash for Locator {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.locator_hash.hash(state);
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ident, self.reference)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    /// The package manager owns the sources and installs them itself.
    Hard,
    /// The sources live elsewhere (e.g. a workspace checkout).
    Soft,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyMeta {
    #[serde(default)]
    pub optional: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDependencyMeta {
    #[serde(default)]
    pub optional: bool,
}

/// Full resolved metadata for a locator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Package {
    pub locator: Locator,
    pub version: Option<String>,
    pub language_name: String,
    pub link_type: LinkType,
    pub dependencies: BTreeMap<IdentHash, Descriptor>,
    pub peer_dependencies: BTreeMap<IdentHash, Descriptor>,
    pub dependencies_meta: BTreeMap<String, DependencyMeta>,
    pub peer_dependencies_meta: BTreeMap<String, PeerDependencyMeta>,
    pub bin: BTreeMap<String, PathBuf>,
}

impl Package {
    pub fn new(locator: Locator) -> Self {
        Package {
            locator,
            version: None,
            language_name: "node".to_string(),
            link_type: LinkType::Hard,
            dependencies: BTreeMap::new(),
            peer_dependencies: BTreeMap::new(),
            dependencies_meta: BTreeMap::new(),
            peer_dependencies_meta: BTreeMap::new(),
            bin: BTreeMap::new(),
        }
    }

    pub fn hash(&self) -> &LocatorHash {
        self.locator.hash()
    }

    /// Same package data under a different identity.
    pub fn renamed(&self, locator: Locator) -> Package {
        let mut package = self.clone();
        package.locator = locator;
        package
    }

    pub fn virtualize(&self, entropy: &str) -> Package {
        self.renamed(self.locator.virtualize(entropy))
    }

    pub fn is_virtual(&self) -> bool {
        self.locator.is_virtual()
    }

    pub fn dependency_is_optional(&self, ident: &Ident) -> bool {
        self.dependencies_meta
            .get(&ident.to_string())
            .map(|meta| meta.optional)
            .unwrap_or(false)
    }

    pub fn peer_is_optional(&self, ident: &Ident) -> bool {
        self.peer_dependencies_meta
            .get(&ident.to_string())
            .map(|meta| meta.optional)
            .unwrap_or(false)
    }
}

fn strip_virtual(value: &str) -> Option<&str> {
    let rest = value.strip_prefix(VIRTUAL_PREFIX)?;
    let (_entropy, inner) = rest.split_once('#')?;
    Some(inner)
}

/// Splits `@scope/name@suffix` / `name@suffix` at the last ident
/// boundary. The suffix may itself contain `@` (URLs, protocols).
fn split_ident_suffix(input: &str) -> Option<(&str, &str)> {
    let search_from = if input.starts_with('@') { 1 } else { 0 };
    let at = input[search_from..].find('@')? + search_from;
    let (ident, rest) = input.split_at(at);

    if ident.is_empty() || rest.len() < 2 {
        return None;
    }

    Some((ident, &rest[1..]))
}
