use crate::console;
use crate::ident::{Descriptor, Locator, Package};
use crate::resolver::StoredState;
use crate::{KnotError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// One entry of the previous-format lockfile: the request string maps
/// to a historical "resolved URL" plus optional metadata.
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    resolved: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyLockfile {
    #[serde(default)]
    dependencies: BTreeMap<String, LegacyEntry>,
}

struct ImportPattern {
    regex: Regex,
    /// Builds a modern reference from the regex captures.
    build: fn(&regex::Captures<'_>) -> String,
}

fn import_patterns() -> &'static Vec<ImportPattern> {
    static PATTERNS: OnceLock<Vec<ImportPattern>> = OnceLock::new();

    PATTERNS.get_or_init(|| {
        vec![
            // Registry tarball URLs: .../-/name-1.2.3.tgz
            ImportPattern {
                regex: Regex::new(
                    r"^https?://[^/]+(?:/[^/]+)*/-/[^/]+-(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?)\.tgz$",
                )
                .unwrap(),
                build: |captures| format!("npm:{}", &captures[1]),
            },
            // Git URLs pinned to a commit.
            ImportPattern {
                regex: Regex::new(r"^git\+(https|ssh)://(.+#[0-9a-f]{7,40})$").unwrap(),
                build: |captures| format!("git:{}://{}", &captures[1], &captures[2]),
            },
        ]
    })
}

fn translate_resolved_url(url: &str) -> Option<String> {
    for pattern in import_patterns() {
        if let Some(captures) = pattern.regex.captures(url) {
            return Some((pattern.build)(&captures));
        }
    }

    None
}

/// Scans a previous-format lockfile once, at setup, and synthesizes
/// equivalent modern resolutions for the entries whose historical URLs
/// it still understands. Untranslatable entries are skipped with a
/// warning; they will simply be re-resolved from scratch.
pub fn import_legacy_lockfile(path: &Path) -> Result<StoredState> {
    let data = fs::read_to_string(path).map_err(|source| KnotError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let legacy: LegacyLockfile =
        serde_json::from_str(&data).map_err(|source| KnotError::ParseJson {
            path: path.to_path_buf(),
            source,
        })?;

    let mut stored = StoredState::default();

    for (request, entry) in legacy.dependencies.iter() {
        let descriptor = match Descriptor::parse(request) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                console::warn(&format!(
                    "skipping legacy lockfile entry with malformed request {request}"
                ));
                continue;
            }
        };

        let Some(reference) = translate_resolved_url(&entry.resolved) else {
            console::warn(&format!(
                "skipping legacy lockfile entry {request}: unrecognized resolved URL {}",
                entry.resolved
            ));
            continue;
        };

        let locator = Locator::new(descriptor.ident().clone(), &reference);

        let mut package = Package::new(locator.clone());
        package.version = entry.version.clone().or_else(|| {
            reference
                .strip_prefix("npm:")
                .map(|version| version.to_string())
        });

        stored
            .resolutions
            .insert(descriptor.hash().clone(), locator.hash().clone());
        stored.packages.insert(locator.hash().clone(), package);
    }

    Ok(stored)
}
