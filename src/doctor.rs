//! `cos doctor` diagnostics for the agent runtime and the MCP endpoint.

use crate::command::{AGENT_BINARY, CONTAINER_RUNTIME_BINARY};
use crate::config::{Backend, ConfigEnvironment, Settings};
use crate::report::Check;
use crate::runner::{CommandOutput, ProcessRunner};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_PROBE_TIMEOUT_SECS: f64 = 3.0;
const MIN_PROBE_TIMEOUT_SECS: f64 = 0.2;
const LOCAL_VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(8);
const CONTAINER_EXEC_TIMEOUT: Duration = Duration::from_secs(10);
const CONTAINER_PROBE_TIMEOUT: Duration = Duration::from_secs(12);
const DETAIL_LIMIT_CHARS: usize = 300;

const GITHUB_PAT_SCRIPT: &str =
    r#"if [ -n "${GITHUB_PAT:-}" ]; then echo set; else echo missing; fi"#;
const ASKPASS_SCRIPT: &str =
    r#"p="${HOME:-/home/app}/.codex/git-askpass.sh"; if [ -x "$p" ]; then echo "$p"; fi"#;
const CONTAINER_TCP_SCRIPT: &str = "import socket,sys
host, port, timeout = sys.argv[1], int(sys.argv[2]), max(0.2, float(sys.argv[3]))
socket.create_connection((host, port), timeout=timeout).close()
print(f'Connected to {host}:{port} from container.')
";
const CONTAINER_HTTP_SCRIPT: &str = "import sys
from urllib import error, request
url, timeout = sys.argv[1], max(0.2, float(sys.argv[2]))
try:
    with request.urlopen(request.Request(url, method='GET'), timeout=timeout) as resp:
        print(f'HTTP probe status: {int(resp.status)}')
except error.HTTPError as exc:
    print(f'HTTP probe status: {int(exc.code)}')
except Exception as exc:
    print(f'HTTP probe failed: {exc}')
    raise SystemExit(2)
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

/// Splits an MCP URL into the parts the network probes need.
pub fn resolve_mcp_endpoint(raw: &str) -> Result<McpEndpoint, String> {
    let scheme_error = || "MCP URL must use http or https".to_string();
    let host_error = || "MCP URL must include a host".to_string();
    let url = match Url::parse(raw.trim()) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => return Err(scheme_error()),
        Err(url::ParseError::EmptyHost) => return Err(host_error()),
        Err(err) => return Err(format!("Invalid MCP URL: {err}")),
    };
    let scheme = url.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(scheme_error());
    }
    let host = url
        .host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .filter(|host| !host.is_empty())
        .ok_or_else(host_error)?
        .to_string();
    let port = url
        .port_or_known_default()
        .unwrap_or(if scheme == "https" { 443 } else { 80 });
    Ok(McpEndpoint { scheme, host, port })
}

pub fn probe_timeout(seconds: f64) -> Duration {
    let seconds = if seconds.is_finite() {
        seconds.max(MIN_PROBE_TIMEOUT_SECS)
    } else {
        DEFAULT_PROBE_TIMEOUT_SECS
    };
    Duration::from_secs_f64(seconds)
}

pub fn tcp_probe(host: &str, port: u16, timeout: Duration) -> (bool, String) {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(err) => return (false, format!("Cannot connect to {host}:{port}: {err}")),
    };
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return (true, format!("Connected to {host}:{port}.")),
            Err(err) => last_error = err,
        }
    }
    (false, format!("Cannot connect to {host}:{port}: {last_error}"))
}

/// Any HTTP status counts as reachable; only transport failures fail.
pub fn http_probe(url: &str, timeout: Duration) -> (bool, String) {
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => return (false, format!("HTTP probe failed: {err}")),
    };
    match client.get(url).header("User-Agent", "cos-cli").send() {
        Ok(response) => (true, format!("HTTP probe status: {}", response.status().as_u16())),
        Err(err) => (false, format!("HTTP probe failed: {err}")),
    }
}

fn version_line(output: &CommandOutput, fallback: String) -> String {
    output.first_line().unwrap_or(fallback)
}

fn docker_exec(
    runner: &dyn ProcessRunner,
    container: &str,
    inner: &[&str],
    timeout: Duration,
) -> io::Result<CommandOutput> {
    let mut args = vec!["exec".to_string(), container.to_string()];
    args.extend(inner.iter().map(|arg| arg.to_string()));
    runner.run(CONTAINER_RUNTIME_BINARY, &args, timeout)
}

fn error_detail(err: &io::Error) -> String {
    err.to_string().chars().take(DETAIL_LIMIT_CHARS).collect()
}

fn docker_tcp_probe(
    runner: &dyn ProcessRunner,
    container: &str,
    endpoint: &McpEndpoint,
    timeout: Duration,
) -> (bool, String) {
    let target = format!("{}:{}", endpoint.host, endpoint.port);
    let port = endpoint.port.to_string();
    let seconds = timeout.as_secs_f64().to_string();
    let result = docker_exec(
        runner,
        container,
        &[
            "python",
            "-c",
            CONTAINER_TCP_SCRIPT,
            endpoint.host.as_str(),
            port.as_str(),
            seconds.as_str(),
        ],
        CONTAINER_PROBE_TIMEOUT,
    );
    match result {
        Ok(output) if output.success() => {
            let text = output.stdout_text();
            if text.is_empty() {
                (true, format!("Connected to {target} from container."))
            } else {
                (true, text)
            }
        }
        Ok(output) => (
            false,
            format!("Cannot connect to {target} from container: {}", output.detail()),
        ),
        Err(err) if err.kind() == io::ErrorKind::NotFound => (
            false,
            "Cannot connect from container because 'docker' is not available in PATH.".to_string(),
        ),
        Err(err) => (
            false,
            format!("Cannot connect to {target} from container: {}", error_detail(&err)),
        ),
    }
}

fn docker_http_probe(
    runner: &dyn ProcessRunner,
    container: &str,
    url: &str,
    timeout: Duration,
) -> (bool, String) {
    let seconds = timeout.as_secs_f64().to_string();
    let result = docker_exec(
        runner,
        container,
        &["python", "-c", CONTAINER_HTTP_SCRIPT, url, seconds.as_str()],
        CONTAINER_PROBE_TIMEOUT,
    );
    match result {
        Ok(output) => {
            let text = output.stdout_text();
            if output.success() {
                let message = if text.is_empty() {
                    "HTTP probe succeeded from container.".to_string()
                } else {
                    text
                };
                (true, message)
            } else if !text.is_empty() {
                (false, text.chars().take(DETAIL_LIMIT_CHARS).collect())
            } else {
                (
                    false,
                    format!("HTTP probe failed from container: {}", output.detail()),
                )
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => (
            false,
            "HTTP probe from container failed because 'docker' is not available in PATH."
                .to_string(),
        ),
        Err(err) => (
            false,
            format!("HTTP probe failed from container: {}", error_detail(&err)),
        ),
    }
}

/// Inputs for one diagnostics run.
pub struct DoctorContext<'a> {
    pub settings: &'a Settings,
    pub environment: &'a ConfigEnvironment,
    pub runner: &'a dyn ProcessRunner,
    pub timeout: Duration,
    /// Host variable lookup for the bearer-token check.
    pub host_var: &'a dyn Fn(&str) -> Option<String>,
}

fn collect_local_agent_checks(ctx: &DoctorContext<'_>, checks: &mut Vec<Check>) {
    let Some(path) = ctx.runner.find_binary(AGENT_BINARY) else {
        checks.push(Check::fail("codex_path", "codex binary not found in PATH"));
        return;
    };
    checks.push(Check::ok("codex_path", format!("Found at {}", path.display())));

    let args = vec!["--version".to_string()];
    match ctx.runner.run(AGENT_BINARY, &args, LOCAL_VERSION_TIMEOUT) {
        Ok(output) if output.success() => checks.push(Check::ok(
            "codex_version",
            version_line(&output, "codex --version ok".to_string()),
        )),
        Ok(output) => checks.push(Check::fail(
            "codex_version",
            format!("codex --version failed: {}", output.detail()),
        )),
        Err(err) => checks.push(Check::fail(
            "codex_version",
            format!("codex --version error: {err}"),
        )),
    }
}

fn collect_container_agent_checks(ctx: &DoctorContext<'_>, checks: &mut Vec<Check>) {
    let Some(path) = ctx.runner.find_binary(CONTAINER_RUNTIME_BINARY) else {
        checks.push(Check::fail("docker_path", "docker binary not found in PATH"));
        return;
    };
    checks.push(Check::ok("docker_path", format!("Found at {}", path.display())));

    let container = ctx.settings.docker_container.trim();
    if container.is_empty() {
        checks.push(Check::fail("docker_container", "Container name is empty."));
        return;
    }

    let inspect_args: Vec<String> = ["inspect", "-f", "{{.State.Running}}", container]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    let inspect = match ctx
        .runner
        .run(CONTAINER_RUNTIME_BINARY, &inspect_args, INSPECT_TIMEOUT)
    {
        Ok(output) => output,
        Err(err) => {
            checks.push(Check::fail(
                "docker_container",
                format!("Container '{container}' unavailable: {}", error_detail(&err)),
            ));
            return;
        }
    };
    if !inspect.success() {
        checks.push(Check::fail(
            "docker_container",
            format!("Container '{container}' unavailable: {}", inspect.detail()),
        ));
        return;
    }
    if !inspect.stdout_text().eq_ignore_ascii_case("true") {
        checks.push(Check::fail(
            "docker_container",
            format!("Container '{container}' is not running."),
        ));
        return;
    }
    checks.push(Check::ok(
        "docker_container",
        format!("Container '{container}' is running."),
    ));

    let binary = ctx.settings.container_agent_binary();
    match docker_exec(ctx.runner, container, &[binary, "--version"], CONTAINER_EXEC_TIMEOUT) {
        Ok(output) if output.success() => checks.push(Check::ok(
            "codex_in_docker",
            version_line(&output, format!("{binary} --version ok")),
        )),
        Ok(output) => checks.push(Check::fail(
            "codex_in_docker",
            format!(
                "Failed to run '{binary}' in container '{container}': {}",
                output.detail()
            ),
        )),
        Err(err) => checks.push(Check::fail(
            "codex_in_docker",
            format!(
                "Failed to run '{binary}' in container '{container}': {}",
                error_detail(&err)
            ),
        )),
    }

    collect_container_git_auth_checks(ctx, container, checks);
}

fn collect_container_git_auth_checks(
    ctx: &DoctorContext<'_>,
    container: &str,
    checks: &mut Vec<Check>,
) {
    let git_failure = |detail: String| {
        Check::fail(
            "git_in_docker",
            format!("Failed to run 'git --version' in container '{container}': {detail}"),
        )
    };
    match docker_exec(ctx.runner, container, &["git", "--version"], CONTAINER_EXEC_TIMEOUT) {
        Ok(output) if output.success() => checks.push(Check::ok(
            "git_in_docker",
            version_line(&output, "git --version ok".to_string()),
        )),
        Ok(output) => {
            checks.push(git_failure(output.detail()));
            return;
        }
        Err(err) => {
            checks.push(git_failure(error_detail(&err)));
            return;
        }
    }

    let pat = docker_exec(
        ctx.runner,
        container,
        &["sh", "-lc", GITHUB_PAT_SCRIPT],
        INSPECT_TIMEOUT,
    );
    let pat_detail = match &pat {
        Ok(output) if output.success() => None,
        Ok(output) => Some(output.detail()),
        Err(err) => Some(error_detail(err)),
    };
    if let Some(detail) = pat_detail {
        checks.push(Check::warn(
            "github_pat_in_docker",
            format!("Could not verify GITHUB_PAT in container '{container}': {detail}"),
        ));
        checks.push(Check::warn(
            "git_push_auth_in_docker",
            "Skipped askpass verification because GITHUB_PAT availability could not be determined.",
        ));
        return;
    }
    let pat_is_set = pat
        .map(|output| output.stdout_text().eq_ignore_ascii_case("set"))
        .unwrap_or(false);
    if !pat_is_set {
        checks.push(Check::warn(
            "github_pat_in_docker",
            "Environment variable GITHUB_PAT is not set in container.",
        ));
        checks.push(Check::warn(
            "git_push_auth_in_docker",
            "Skipped askpass verification because GITHUB_PAT is not set.",
        ));
        return;
    }
    checks.push(Check::ok(
        "github_pat_in_docker",
        "Environment variable GITHUB_PAT is set in container.",
    ));

    let askpass = docker_exec(
        ctx.runner,
        container,
        &["sh", "-lc", ASKPASS_SCRIPT],
        INSPECT_TIMEOUT,
    );
    let check = match askpass {
        Ok(output) if output.success() => match output.stdout_text() {
            path if path.is_empty() => Check::fail(
                "git_push_auth_in_docker",
                "GITHUB_PAT is set but git askpass script is missing or not executable.",
            ),
            path => Check::ok(
                "git_push_auth_in_docker",
                format!("Found executable git askpass script at {path}"),
            ),
        },
        Ok(output) => Check::fail(
            "git_push_auth_in_docker",
            format!(
                "Failed to verify git askpass script in container '{container}': {}",
                output.detail()
            ),
        ),
        Err(err) => Check::fail(
            "git_push_auth_in_docker",
            format!(
                "Failed to verify git askpass script in container '{container}': {}",
                error_detail(&err)
            ),
        ),
    };
    checks.push(check);
}

fn collect_mcp_checks(ctx: &DoctorContext<'_>, checks: &mut Vec<Check>) {
    let url = ctx.settings.app_mcp_url.trim();
    let endpoint = match resolve_mcp_endpoint(url) {
        Ok(endpoint) => endpoint,
        Err(message) => {
            checks.push(Check::fail("mcp_url", message));
            return;
        }
    };
    checks.push(Check::ok(
        "mcp_url",
        format!(
            "Parsed {} endpoint {}:{}",
            endpoint.scheme, endpoint.host, endpoint.port
        ),
    ));

    let container = ctx.settings.docker_container.trim();
    let in_container = ctx.settings.codex_backend == Backend::Docker;
    let (tcp_ok, tcp_message) = if in_container {
        docker_tcp_probe(ctx.runner, container, &endpoint, ctx.timeout)
    } else {
        tcp_probe(&endpoint.host, endpoint.port, ctx.timeout)
    };
    if !tcp_ok {
        checks.push(Check::fail("mcp_tcp", tcp_message));
        return;
    }
    checks.push(Check::ok("mcp_tcp", tcp_message));

    let (http_ok, http_message) = if in_container {
        docker_http_probe(ctx.runner, container, url, ctx.timeout)
    } else {
        http_probe(url, ctx.timeout)
    };
    checks.push(if http_ok {
        Check::ok("mcp_http", http_message)
    } else {
        Check::warn("mcp_http", http_message)
    });
}

pub fn collect_doctor_checks(ctx: &DoctorContext<'_>) -> Vec<Check> {
    let mut checks = vec![Check::ok(
        "cos",
        format!("cos {}", env!("CARGO_PKG_VERSION")),
    )];

    let backend = ctx.settings.codex_backend;
    checks.push(Check::ok(
        "codex_backend",
        format!("Using backend '{backend}'."),
    ));
    match backend {
        Backend::Docker => collect_container_agent_checks(ctx, &mut checks),
        Backend::Local => collect_local_agent_checks(ctx, &mut checks),
    }

    collect_mcp_checks(ctx, &mut checks);

    let prompt_path = ctx
        .environment
        .expand_path(ctx.settings.system_prompt_file.trim());
    if prompt_path.is_file() {
        checks.push(Check::ok(
            "system_prompt_file",
            format!("Found {}", prompt_path.display()),
        ));
    } else {
        checks.push(Check::warn(
            "system_prompt_file",
            format!("Optional file not found: {}", prompt_path.display()),
        ));
    }

    let token_env = ctx.settings.app_mcp_bearer_env.trim();
    if !token_env.is_empty() {
        let is_set = (ctx.host_var)(token_env)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        checks.push(if is_set {
            Check::ok(
                "mcp_bearer_env",
                format!("Environment variable '{token_env}' is set."),
            )
        } else {
            Check::warn(
                "mcp_bearer_env",
                format!("Environment variable '{token_env}' is not set."),
            )
        });
    }

    debug!(checks = checks.len(), "doctor checks collected");
    checks
}
