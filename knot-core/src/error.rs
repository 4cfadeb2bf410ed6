use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KnotError {
    #[error("Failed to read file {path:?}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[error("Failed to write file {path:?}: {source}")]
    WriteFile { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse JSON in {path:?}: {source}")]
    ParseJson { path: PathBuf, source: serde_json::Error },

    #[error("Project manifest package.json not found at {path:?}")]
    ManifestMissing { path: PathBuf },

    #[error("Invalid manifest in {path:?}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("Failed to read lockfile {path:?}: {source}")]
    LockfileRead { path: PathBuf, source: serde_yaml::Error },

    #[error("Failed to write lockfile {path:?}: {source}")]
    LockfileWrite { path: PathBuf, source: serde_yaml::Error },

    #[error("Malformed descriptor string: {input}")]
    BadDescriptor { input: String },

    #[error("Malformed locator string: {input}")]
    BadLocator { input: String },

    #[error("Invalid semver range {value}: {source}")]
    Semver { value: String, source: knot_semver::Error },

    #[error("No resolver accepted {request}")]
    NoResolverFound { request: String },

    #[error("No candidates found for {descriptor}")]
    NoCandidates { descriptor: String },

    #[error("Resolver returned a different package identity: expected {expected}, got {actual}")]
    ResolverChangedLocator { expected: String, actual: String },

    #[error("Failed to resolve {request}: {source}")]
    ResolutionFailed {
        request: String,
        #[source]
        source: Box<KnotError>,
    },

    #[error("Resolution graph invariant violated: {reason}")]
    GraphInvariant { reason: String },

    #[error("Virtualization depth exceeded for {locator}; resolution stack dumped to {dump_path:?}")]
    VirtualDepthExceeded { locator: String, dump_path: PathBuf },

    #[error("Checksum mismatch for {locator}: expected {expected}, got {actual}")]
    CacheChecksumMismatch {
        locator: String,
        expected: String,
        actual: String,
    },

    #[error("Cache entry for {locator} is missing and the cache is immutable")]
    ImmutableCache { locator: String },

    #[error("Cannot remove {path:?}: the cache is immutable")]
    ImmutableCacheCleanup { path: PathBuf },

    #[error("Failed to lock {path:?}: {source}")]
    CacheLock { path: PathBuf, source: std::io::Error },

    #[error("HTTP request to {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("Failed to unpack archive at {path:?}: {source}")]
    Archive { path: PathBuf, source: std::io::Error },

    #[error("Failed to run build directive for {name}: {reason}")]
    ScriptRun { name: String, reason: String },

    #[error("Build failed for {locator} (exit code {code}); logs at {log_path:?}")]
    BuildFailed {
        locator: String,
        code: i32,
        log_path: PathBuf,
    },

    #[error("Circular build dependencies, cannot make progress: {locators}")]
    CyclicBuilds { locators: String },

    #[error("Failed to decode install state {path:?}: {reason}")]
    StateDecode { path: PathBuf, reason: String },

    #[error("Failed to encode install state: {reason}")]
    StateEncode { reason: String },

    #[error("Workspace {ident} is registered twice")]
    DuplicateWorkspace { ident: String },
}

impl KnotError {
    /// Wraps a resolution-time error with the request that triggered it.
    pub fn in_context(self, request: impl Into<String>) -> KnotError {
        match self {
            already @ KnotError::ResolutionFailed { .. } => already,
            other => KnotError::ResolutionFailed {
                request: request.into(),
                source: Box::new(other),
            },
        }
    }
}
