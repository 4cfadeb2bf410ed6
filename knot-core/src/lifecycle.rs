use crate::config::KnotConfig;
use crate::console;
use crate::ident::{make_hash, Locator, LocatorHash};
use crate::linker::BuildRequest;
use crate::resolve::ResolutionGraph;
use crate::{KnotError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// One step of a package build: either a named manifest script or a
/// raw shell command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildDirective {
    Script(String),
    Shell(String),
}

/// Persisted record of completed builds, keyed by locator hash. A
/// package whose stored hash still matches is not rebuilt.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BuildState {
    pub builds: BTreeMap<String, String>,
}

impl BuildState {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(BuildState::default());
        }

        let data = fs::read_to_string(path).map_err(|source| KnotError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&data).map_err(|source| KnotError::ParseJson {
            path: path.to_path_buf(),
            source,
        })
    }

    /// An empty table leaves no file behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.builds.is_empty() {
            if path.is_file() {
                fs::remove_file(path).map_err(|source| KnotError::WriteFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| KnotError::WriteFile {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let data = serde_json::to_string_pretty(self).map_err(|source| KnotError::ParseJson {
            path: path.to_path_buf(),
            source,
        })?;

        fs::write(path, data).map_err(|source| KnotError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: Vec<Locator>,
    pub skipped: Vec<Locator>,
    pub failed_optional: Vec<Locator>,
}

/// Hash of a package's position in the graph: its own identity plus
/// the base hashes of everything it depends on. Cycles collapse to a
/// fixed sentinel so the hash stays stable either way around the loop.
fn base_hashes(graph: &ResolutionGraph) -> Result<BTreeMap<LocatorHash, String>> {
    fn visit(
        graph: &ResolutionGraph,
        hash: &LocatorHash,
        stack: &mut BTreeSet<LocatorHash>,
        memo: &mut BTreeMap<LocatorHash, String>,
    ) -> Result<String> {
        if let Some(known) = memo.get(hash) {
            return Ok(known.clone());
        }

        if !stack.insert(hash.clone()) {
            return Ok("cycle".to_string());
        }

        let package = graph.package_of(hash)?;
        let mut parts: Vec<String> = vec![package.locator.to_string()];

        for descriptor in package.dependencies.values() {
            let resolution = graph.resolution_of(descriptor.hash())?.clone();
            parts.push(visit(graph, &resolution, stack, memo)?);
        }

        stack.remove(hash);

        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let digest = make_hash(&refs);
        memo.insert(hash.clone(), digest.clone());
        Ok(digest)
    }

    let mut memo = BTreeMap::new();
    for hash in graph.accessible.iter() {
        let mut stack = BTreeSet::new();
        visit(graph, hash, &mut stack, &mut memo)?;
    }

    Ok(memo)
}

/// Hash gating one package's build: environment, graph position,
/// install location and the directives themselves. Any change forces a
/// rebuild.
fn build_hash(request: &BuildRequest, base: &str) -> String {
    let directives = request
        .directives
        .iter()
        .map(|directive| match directive {
            BuildDirective::Script(name) => format!("script:{name}"),
            BuildDirective::Shell(command) => format!("shell:{command}"),
        })
        .collect::<Vec<_>>()
        .join(",");

    let location = request.location.to_string_lossy();

    make_hash(&[
        std::env::consts::OS,
        std::env::consts::ARCH,
        base,
        location.as_ref(),
        &directives,
    ])
}

/// Runs pending builds in dependency order: each pass takes the
/// requests whose dependencies have no pending build left, and a pass
/// that can take nothing while work remains means the remaining builds
/// form a cycle.
pub fn build_everything(
    graph: &ResolutionGraph,
    requests: Vec<BuildRequest>,
    config: &KnotConfig,
    state_path: &Path,
) -> Result<BuildReport> {
    let mut report = BuildReport::default();

    if requests.is_empty() {
        return Ok(report);
    }

    let bases = base_hashes(graph)?;
    let mut state = BuildState::load(state_path)?;

    let mut pending: BTreeMap<LocatorHash, BuildRequest> = requests
        .into_iter()
        .map(|request| (request.locator.hash().clone(), request))
        .collect();

    let log_dir = std::env::temp_dir().join(format!("knot-build-{}", std::process::id()));

    while !pending.is_empty() {
        let ready: Vec<LocatorHash> = pending
            .keys()
            .filter(|hash| {
                let Ok(package) = graph.package_of(*hash) else {
                    return true;
                };

                package.dependencies.values().all(|descriptor| {
                    match graph.resolutions.get(descriptor.hash()) {
                        Some(resolution) => resolution == *hash || !pending.contains_key(resolution),
                        None => true,
                    }
                })
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            let locators = pending
                .values()
                .map(|request| request.locator.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(KnotError::CyclicBuilds { locators });
        }

        for hash in ready {
            let request = pending.remove(&hash).unwrap();

            let base = bases.get(&hash).cloned().unwrap_or_default();
            let expected = build_hash(&request, &base);

            if state.builds.get(hash.as_str()) == Some(&expected) {
                report.skipped.push(request.locator.clone());
                continue;
            }

            match run_build(&request, &log_dir) {
                Ok(()) => {
                    state.builds.insert(hash.as_str().to_string(), expected);
                    report.built.push(request.locator.clone());
                }
                Err(error) => {
                    if graph.optional_builds.contains(&hash) {
                        console::warn(&format!(
                            "optional build of {} failed, continuing: {error}",
                            request.locator
                        ));
                        // Recorded as done: a failed optional build is
                        // not retried until its inputs change.
                        state.builds.insert(hash.as_str().to_string(), expected);
                        report.failed_optional.push(request.locator.clone());
                    } else {
                        // Persist what did succeed before bailing out.
                        state.save(state_path)?;
                        return Err(error);
                    }
                }
            }
        }
    }

    if !config.enable_scripts {
        // Unreachable in practice: the linker emits no requests when
        // scripts are disabled. Kept as a safety net for custom linkers.
        console::verbose("builds ran with scripts disabled in configuration");
    }

    state.save(state_path)?;
    Ok(report)
}

fn run_build(request: &BuildRequest, log_dir: &Path) -> Result<()> {
    for directive in request.directives.iter() {
        let script = match directive {
            BuildDirective::Shell(command) => command.clone(),
            BuildDirective::Script(name) => {
                match manifest_script(&request.location, name)? {
                    Some(script) => script,
                    None => continue,
                }
            }
        };

        let mut command = make_shell_command(&script);
        command.current_dir(&request.location);

        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let output = command.output().map_err(|source| KnotError::ScriptRun {
            name: request.locator.to_string(),
            reason: source.to_string(),
        })?;

        if !output.status.success() {
            let log_path = write_build_log(log_dir, request, &output)?;
            return Err(KnotError::BuildFailed {
                locator: request.locator.to_string(),
                code: output.status.code().unwrap_or(1),
                log_path,
            });
        }
    }

    Ok(())
}

fn manifest_script(location: &Path, name: &str) -> Result<Option<String>> {
    let manifest_path = location.join("package.json");
    if !manifest_path.is_file() {
        return Ok(None);
    }

    let data = fs::read_to_string(&manifest_path).map_err(|source| KnotError::ReadFile {
        path: manifest_path.clone(),
        source,
    })?;

    let value: Value = serde_json::from_str(&data).map_err(|source| KnotError::ParseJson {
        path: manifest_path,
        source,
    })?;

    Ok(value
        .get("scripts")
        .and_then(|scripts| scripts.get(name))
        .and_then(|script| script.as_str())
        .filter(|script| !script.is_empty())
        .map(|script| script.to_string()))
}

fn write_build_log(
    log_dir: &Path,
    request: &BuildRequest,
    output: &std::process::Output,
) -> Result<PathBuf> {
    fs::create_dir_all(log_dir).map_err(|source| KnotError::WriteFile {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let log_path = log_dir.join(format!("{}.log", request.locator.slug()));

    let mut contents = Vec::new();
    contents.extend_from_slice(&output.stdout);
    contents.extend_from_slice(&output.stderr);

    fs::write(&log_path, contents).map_err(|source| KnotError::WriteFile {
        path: log_path.clone(),
        source,
    })?;

    Ok(log_path)
}

#[cfg(unix)]
fn make_shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(windows)]
fn make_shell_command(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{Descriptor, Ident, Package};

    fn test_config() -> KnotConfig {
        let mut config = KnotConfig::from_env();
        config.enable_scripts = true;
        config
    }

    fn add_package(graph: &mut ResolutionGraph, name: &str) -> Locator {
        let locator = Locator::new(Ident::new(None, name), "npm:1.0.0");
        graph.accessible.insert(locator.hash().clone());
        graph
            .packages
            .insert(locator.hash().clone(), Package::new(locator.clone()));
        locator
    }

    fn add_edge(graph: &mut ResolutionGraph, parent: &Locator, child: &Locator) {
        let descriptor = Descriptor::new(child.ident().clone(), "npm:^1.0.0");
        graph
            .descriptors
            .insert(descriptor.hash().clone(), descriptor.clone());
        graph
            .resolutions
            .insert(descriptor.hash().clone(), child.hash().clone());
        graph
            .packages
            .get_mut(parent.hash())
            .unwrap()
            .dependencies
            .insert(descriptor.ident().hash().clone(), descriptor);
    }

    fn shell_request(locator: &Locator, dir: &Path, command: &str) -> BuildRequest {
        BuildRequest {
            locator: locator.clone(),
            location: dir.to_path_buf(),
            directives: vec![BuildDirective::Shell(command.to_string())],
        }
    }

    #[test]
    fn builds_run_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = ResolutionGraph::new();

        let app = add_package(&mut graph, "app");
        let dep = add_package(&mut graph, "dep");
        add_edge(&mut graph, &app, &dep);

        let marker = dir.path().join("order.txt");
        let requests = vec![
            shell_request(&app, dir.path(), &format!("echo app >> {}", marker.display())),
            shell_request(&dep, dir.path(), &format!("echo dep >> {}", marker.display())),
        ];

        let state_path = dir.path().join("build-state.json");
        let report =
            build_everything(&graph, requests, &test_config(), &state_path).unwrap();

        assert_eq!(report.built.len(), 2);
        assert_eq!(
            fs::read_to_string(&marker).unwrap().lines().collect::<Vec<_>>(),
            vec!["dep", "app"]
        );
    }

    #[test]
    fn unchanged_builds_are_skipped_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = ResolutionGraph::new();
        let pkg = add_package(&mut graph, "pkg");

        let state_path = dir.path().join("build-state.json");
        let request = shell_request(&pkg, dir.path(), "true");

        let first =
            build_everything(&graph, vec![request.clone()], &test_config(), &state_path)
                .unwrap();
        assert_eq!(first.built.len(), 1);

        let second =
            build_everything(&graph, vec![request], &test_config(), &state_path).unwrap();
        assert_eq!(second.built.len(), 0);
        assert_eq!(second.skipped.len(), 1);
    }

    #[test]
    fn failed_required_build_is_fatal_with_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = ResolutionGraph::new();
        let pkg = add_package(&mut graph, "broken");

        let request = shell_request(&pkg, dir.path(), "echo oops >&2; exit 3");
        let state_path = dir.path().join("build-state.json");

        let error =
            build_everything(&graph, vec![request], &test_config(), &state_path).unwrap_err();

        match error {
            KnotError::BuildFailed { code, log_path, .. } => {
                assert_eq!(code, 3);
                assert!(fs::read_to_string(log_path).unwrap().contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failed_optional_build_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = ResolutionGraph::new();
        let pkg = add_package(&mut graph, "flaky");
        graph.optional_builds.insert(pkg.hash().clone());

        let request = shell_request(&pkg, dir.path(), "exit 1");
        let state_path = dir.path().join("build-state.json");

        let report =
            build_everything(&graph, vec![request], &test_config(), &state_path).unwrap();

        assert!(report.built.is_empty());
        assert_eq!(report.failed_optional.len(), 1);
    }

    #[test]
    fn failed_optional_build_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = ResolutionGraph::new();
        let pkg = add_package(&mut graph, "flaky");
        graph.optional_builds.insert(pkg.hash().clone());

        let marker = dir.path().join("attempts.txt");
        let request = shell_request(
            &pkg,
            dir.path(),
            &format!("echo try >> {}; exit 1", marker.display()),
        );
        let state_path = dir.path().join("build-state.json");

        let first =
            build_everything(&graph, vec![request.clone()], &test_config(), &state_path)
                .unwrap();
        assert_eq!(first.failed_optional.len(), 1);

        // The failure is recorded under its build hash, so the rerun
        // skips it instead of trying again.
        let second =
            build_everything(&graph, vec![request], &test_config(), &state_path).unwrap();
        assert_eq!(second.skipped.len(), 1);
        assert!(second.failed_optional.is_empty());
        assert_eq!(fs::read_to_string(&marker).unwrap().lines().count(), 1);
    }

    #[test]
    fn saving_an_empty_build_table_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("build-state.json");

        let mut state = BuildState::default();
        state
            .builds
            .insert("some-hash".to_string(), "some-build".to_string());
        state.save(&state_path).unwrap();
        assert!(state_path.is_file());

        BuildState::default().save(&state_path).unwrap();
        assert!(!state_path.is_file());
    }

    #[test]
    fn mutual_dependency_between_builds_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = ResolutionGraph::new();

        let ping = add_package(&mut graph, "ping");
        let pong = add_package(&mut graph, "pong");
        add_edge(&mut graph, &ping, &pong);
        add_edge(&mut graph, &pong, &ping);

        let requests = vec![
            shell_request(&ping, dir.path(), "true"),
            shell_request(&pong, dir.path(), "true"),
        ];
        let state_path = dir.path().join("build-state.json");

        let error =
            build_everything(&graph, requests, &test_config(), &state_path).unwrap_err();
        assert!(matches!(error, KnotError::CyclicBuilds { .. }));
    }

    #[test]
    fn manifest_scripts_resolve_from_package_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = ResolutionGraph::new();
        let pkg = add_package(&mut graph, "scripted");

        let marker = dir.path().join("ran.txt");
        fs::write(
            dir.path().join("package.json"),
            format!(
                r#"{{"name":"scripted","scripts":{{"install":"echo done > {}"}}}}"#,
                marker.display()
            ),
        )
        .unwrap();

        let request = BuildRequest {
            locator: pkg.clone(),
            location: dir.path().to_path_buf(),
            directives: vec![
                BuildDirective::Script("preinstall".to_string()),
                BuildDirective::Script("install".to_string()),
            ],
        };

        let state_path = dir.path().join("build-state.json");
        let report =
            build_everything(&graph, vec![request], &test_config(), &state_path).unwrap();

        assert_eq!(report.built.len(), 1);
        assert!(marker.is_file());
    }
}
