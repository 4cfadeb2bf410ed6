use directories::ProjectDirs;
use std::path::PathBuf;
use std::{env, fmt};

/// How a checksum mismatch between the lockfile and the on-disk cache
/// entry is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Trust the expected value from the lockfile.
    Ignore,
    /// Trust the actual on-disk value and persist it.
    Update,
    /// Fail the install.
    Throw,
}

impl fmt::Display for ChecksumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChecksumPolicy::Ignore => "ignore",
            ChecksumPolicy::Update => "update",
            ChecksumPolicy::Throw => "throw",
        };
        f.write_str(name)
    }
}

/// All tunables, built once and passed by reference through every
/// component entry point. Nothing in knot-core reads ambient state
/// after construction.
#[derive(Debug, Clone)]
pub struct KnotConfig {
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Secondary read-through cache shared between projects, keyed by
    /// version rather than checksum.
    pub mirror_dir: Option<PathBuf>,
    pub checksum_policy: ChecksumPolicy,
    /// Verification mode: every cache entry is re-hashed and mismatches
    /// are always fatal, whatever the configured policy says.
    pub check_cache: bool,
    pub skip_integrity_check: bool,
    /// When set, a cache miss is an error instead of a loader call.
    pub immutable_cache: bool,
    /// Protocol prefixed onto bare semver ranges, e.g. `npm:`.
    pub default_protocol: String,
    pub registry_url: String,
    pub fetch_concurrency: usize,
    pub enable_scripts: bool,
}

impl KnotConfig {
    pub fn from_env() -> Self {
        let dirs = ProjectDirs::from("io", "knot", "knot");

        let (cache_dir, data_dir) = match dirs {
            Some(dirs) => (
                dirs.cache_dir().to_path_buf(),
                dirs.data_local_dir().to_path_buf(),
            ),
            None => {
                let fallback = PathBuf::from(".knot");
                (fallback.join("cache"), fallback.join("data"))
            }
        };

        let mirror_dir = env::var("KNOT_MIRROR_DIR")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let checksum_policy = match env::var("KNOT_CHECKSUM_POLICY").as_deref() {
            Ok("ignore") => ChecksumPolicy::Ignore,
            Ok("update") => ChecksumPolicy::Update,
            _ => ChecksumPolicy::Throw,
        };

        let registry_url = env::var("KNOT_REGISTRY")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "https://registry.npmjs.org".to_string());

        let fetch_concurrency = env::var("KNOT_FETCH_CONCURRENCY")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|parsed| *parsed > 0)
            .unwrap_or(16);

        KnotConfig {
            cache_dir,
            data_dir,
            mirror_dir,
            checksum_policy,
            check_cache: false,
            skip_integrity_check: false,
            immutable_cache: env_flag("KNOT_IMMUTABLE_CACHE"),
            default_protocol: "npm:".to_string(),
            registry_url,
            fetch_concurrency,
            enable_scripts: env_flag("KNOT_ENABLE_SCRIPTS"),
        }
    }

    pub fn lockfile_name(&self) -> &'static str {
        "knot.lock"
    }

    pub fn install_state_path(&self, project_root: &std::path::Path) -> PathBuf {
        project_root.join(".knot").join("install-state.bin")
    }

    pub fn build_state_path(&self, project_root: &std::path::Path) -> PathBuf {
        project_root.join(".knot").join("build-state.json")
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            !trimmed.is_empty() && trimmed != "0" && trimmed != "false"
        }
        Err(_) => false,
    }
}
