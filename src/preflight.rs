//! Checks that run before the agent starts, plus container lookups the run flow needs.

use crate::command::{AGENT_BINARY, CONTAINER_RUNTIME_BINARY};
use crate::config::{Backend, ConfigEnvironment, Settings, WORKSPACE_SCOPE_ENV_KEYS};
use crate::error::CosError;
use crate::runner::{CommandOutput, ProcessRunner};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(8);
const SESSION_SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const SESSIONS_MARKER: &str = "/.codex/sessions/";
const SESSION_SEARCH_SCRIPT: &str =
    r#"test -d "$1" || exit 0; find "$1" -type f -name "*$2.jsonl" 2>/dev/null"#;

static SESSION_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid session id pattern"));

fn run_docker(
    runner: &dyn ProcessRunner,
    args: &[&str],
    timeout: Duration,
) -> io::Result<CommandOutput> {
    let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    runner.run(CONTAINER_RUNTIME_BINARY, &args, timeout)
}

/// Verifies the backend can start the agent; nothing is spawned on failure.
pub fn ensure_runtime_ready(settings: &Settings, runner: &dyn ProcessRunner) -> Result<(), CosError> {
    match settings.codex_backend {
        Backend::Local => {
            if runner.find_binary(AGENT_BINARY).is_none() {
                return Err(CosError::Runtime(
                    "The `codex` binary is not available in PATH. Install Codex first, then run `cos` again."
                        .to_string(),
                ));
            }
            Ok(())
        }
        Backend::Docker => ensure_container_ready(settings, runner),
    }
}

fn ensure_container_ready(settings: &Settings, runner: &dyn ProcessRunner) -> Result<(), CosError> {
    if runner.find_binary(CONTAINER_RUNTIME_BINARY).is_none() {
        return Err(CosError::Runtime(
            "The `docker` binary is not available in PATH. Install Docker first, then run `cos` again."
                .to_string(),
        ));
    }
    let container = settings.docker_container.trim();
    if container.is_empty() {
        return Err(CosError::Runtime(
            "Docker backend requires a non-empty docker container name.".to_string(),
        ));
    }

    let inspect = run_docker(
        runner,
        &["inspect", "-f", "{{.State.Running}}", container],
        PROBE_TIMEOUT,
    )
    .map_err(|err| {
        CosError::Runtime(format!("Docker container '{container}' is not available: {err}"))
    })?;
    if !inspect.success() {
        return Err(CosError::Runtime(format!(
            "Docker container '{container}' is not available: {}",
            inspect.detail()
        )));
    }
    if !inspect.stdout_text().eq_ignore_ascii_case("true") {
        return Err(CosError::Runtime(format!(
            "Docker container '{container}' is not running."
        )));
    }

    let binary = settings.container_agent_binary();
    let missing = || {
        CosError::Runtime(format!(
            "Codex binary '{binary}' was not found in Docker container '{container}'."
        ))
    };
    let version = run_docker(runner, &["exec", container, binary, "--version"], PROBE_TIMEOUT)
        .map_err(|_| missing())?;
    if !version.success() {
        return Err(missing());
    }
    debug!(container, binary, "container runtime ready");
    Ok(())
}

/// Finds the `HOME` a container session was recorded under, or "" when unknown.
pub fn find_docker_resume_home(
    runner: &dyn ProcessRunner,
    container: &str,
    session_id: &str,
    search_root: &str,
) -> Result<String, CosError> {
    let session_id = session_id.trim();
    if !SESSION_ID_PATTERN.is_match(session_id) {
        return Ok(String::new());
    }
    let root = search_root.trim();
    if root.is_empty() {
        return Ok(String::new());
    }

    let output = run_docker(
        runner,
        &[
            "exec",
            container.trim(),
            "sh",
            "-c",
            SESSION_SEARCH_SCRIPT,
            "sh",
            root,
            session_id,
        ],
        SESSION_SEARCH_TIMEOUT,
    )
    .map_err(|err| {
        CosError::Runtime(format!(
            "Failed to search docker Codex sessions for '{session_id}': {err}"
        ))
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let home = stdout
        .lines()
        .find_map(|line| line.find(SESSIONS_MARKER).map(|index| &line[..index]));
    match home {
        Some(home) => Ok(home.to_string()),
        None if output.success() => Ok(String::new()),
        None => Err(CosError::Runtime(format!(
            "Failed to search docker Codex sessions for '{session_id}': {}",
            output.detail()
        ))),
    }
}

fn pick_workspace_id(lookup: impl Fn(&str) -> Option<String>) -> String {
    WORKSPACE_SCOPE_ENV_KEYS
        .iter()
        .find_map(|key| lookup(key).filter(|value| !value.is_empty()))
        .unwrap_or_default()
}

/// Workspace the application runtime is scoped to; failures degrade to "".
pub fn detect_workspace_id(
    settings: &Settings,
    environment: &ConfigEnvironment,
    runner: &dyn ProcessRunner,
) -> String {
    match settings.codex_backend {
        Backend::Local => pick_workspace_id(|key| environment.var(key).map(str::to_string)),
        Backend::Docker => {
            let container = settings.docker_container.trim();
            if container.is_empty() {
                return String::new();
            }
            match run_docker(runner, &["exec", container, "env"], PROBE_TIMEOUT) {
                Ok(output) if output.success() => {
                    let vars = parse_env_listing(&output.stdout_text());
                    pick_workspace_id(|key| vars.get(key).cloned())
                }
                Ok(output) => {
                    warn!(container, detail = %output.detail(), "workspace detection failed");
                    String::new()
                }
                Err(err) => {
                    warn!(container, error = %err, "workspace detection failed");
                    String::new()
                }
            }
        }
    }
}

fn parse_env_listing(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| WORKSPACE_SCOPE_ENV_KEYS.contains(key))
        .map(|(key, value)| (key.to_string(), value.trim().to_string()))
        .collect()
}
