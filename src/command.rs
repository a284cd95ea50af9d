//! Argument-vector construction for the agent. The order of tokens is part of the contract.

use crate::config::{Backend, Settings, TerminalTheme};
use crate::error::CosError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

pub const AGENT_BINARY: &str = "codex";
pub const CONTAINER_RUNTIME_BINARY: &str = "docker";

static MCP_SERVER_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid MCP server name pattern"));

const NO_COLOR_ENV_DEFAULTS: [(&str, &str); 3] =
    [("NO_COLOR", "1"), ("CLICOLOR", "0"), ("CLICOLOR_FORCE", "0")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Chat,
    Exec,
    Resume,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Chat => "chat",
            CommandKind::Exec => "exec",
            CommandKind::Resume => "resume",
        }
    }

    /// Chat and resume drive the agent's full-screen interface.
    pub fn is_interactive(self) -> bool {
        matches!(self, CommandKind::Chat | CommandKind::Resume)
    }

    fn subcommand(self) -> Option<&'static str> {
        match self {
            CommandKind::Chat => None,
            CommandKind::Exec => Some("exec"),
            CommandKind::Resume => Some("resume"),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub dangerous: bool,
    pub search: bool,
    pub json: bool,
    pub skip_git_repo_check: bool,
    pub no_app_mcp: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeTarget {
    pub session_id: String,
    pub last: bool,
    pub all: bool,
}

/// Everything the builder needs for one run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub kind: CommandKind,
    pub settings: Settings,
    pub flags: RunFlags,
    pub resume: ResumeTarget,
    /// `HOME` inside the container, when a resumed session needs its original one.
    pub container_home: String,
    pub interactive_tty: bool,
}

impl Invocation {
    /// The container's TTY allocation needs a real terminal on both ends.
    pub fn ensure_terminal_available(&self) -> Result<(), CosError> {
        if self.settings.codex_backend == Backend::Docker
            && self.kind.is_interactive()
            && !self.interactive_tty
        {
            return Err(CosError::Usage(format!(
                "`cos {}` in docker backend requires an interactive TTY terminal.",
                self.kind
            )));
        }
        Ok(())
    }
}

/// The child process invocation, fixed once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
    env_defaults: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Variables set for the child only when the environment does not already define them.
    pub fn env_defaults(&self) -> &BTreeMap<String, String> {
        &self.env_defaults
    }
}

/// Quotes a value as a TOML basic string.
pub fn toml_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

/// Returns the trimmed name; an empty name is valid and disables injection.
pub fn validate_mcp_server_name(name: &str) -> Result<&str, CosError> {
    let value = name.trim();
    if value.is_empty() || MCP_SERVER_NAME_PATTERN.is_match(value) {
        return Ok(value);
    }
    Err(CosError::Usage(format!(
        "Invalid MCP server name {value:?}: must match pattern ^[a-zA-Z0-9_-]+$"
    )))
}

/// Drops the `--` separator some shells leave in front of forwarded arguments.
pub fn normalize_passthrough(args: Vec<String>) -> Vec<String> {
    let mut args = args;
    if args.first().map(String::as_str) == Some("--") {
        args.remove(0);
    }
    args
}

fn push_flag_value(cmd: &mut Vec<String>, flag: &str, value: &str) {
    cmd.push(flag.to_string());
    cmd.push(value.to_string());
}

fn mcp_overrides(invocation: &Invocation) -> Result<Vec<String>, CosError> {
    let settings = &invocation.settings;
    if invocation.flags.no_app_mcp {
        return Ok(Vec::new());
    }
    let name = validate_mcp_server_name(&settings.app_mcp_name)?;
    let url = settings.app_mcp_url.trim();
    if name.is_empty() || url.is_empty() {
        return Ok(Vec::new());
    }

    let mut overrides = Vec::new();
    push_flag_value(
        &mut overrides,
        "-c",
        &format!("mcp_servers.{name}.url={}", toml_quote(url)),
    );
    push_flag_value(
        &mut overrides,
        "-c",
        &format!("mcp_servers.{name}.enabled=true"),
    );
    let token_env = settings.app_mcp_bearer_env.trim();
    if !token_env.is_empty() {
        push_flag_value(
            &mut overrides,
            "-c",
            &format!(
                "mcp_servers.{name}.bearer_token_env_var={}",
                toml_quote(token_env)
            ),
        );
    }
    Ok(overrides)
}

fn has_color_flag(args: &[String]) -> bool {
    args.iter()
        .any(|arg| arg == "--color" || arg.starts_with("--color="))
}

fn build_agent_command(
    invocation: &Invocation,
    prompt: &str,
    passthrough: &[String],
) -> Result<Vec<String>, CosError> {
    let settings = &invocation.settings;
    let kind = invocation.kind;
    let flags = &invocation.flags;

    let binary = match settings.codex_backend {
        Backend::Local => AGENT_BINARY,
        Backend::Docker => settings.container_agent_binary(),
    };
    let mut cmd = vec![binary.to_string()];
    if let Some(subcommand) = kind.subcommand() {
        cmd.push(subcommand.to_string());
    }

    let repo = settings.repo.trim();
    if !repo.is_empty() {
        push_flag_value(&mut cmd, "--cd", repo);
    }
    let model = settings.model.trim();
    if !model.is_empty() {
        push_flag_value(&mut cmd, "-m", model);
    }
    push_flag_value(&mut cmd, "--sandbox", settings.sandbox.as_str());
    if kind.is_interactive() {
        push_flag_value(&mut cmd, "--ask-for-approval", settings.approval.as_str());
    }
    if flags.dangerous {
        cmd.push("--dangerously-bypass-approvals-and-sandbox".to_string());
    }
    if kind.is_interactive() && flags.search {
        cmd.push("--search".to_string());
    }

    match kind {
        CommandKind::Exec => {
            if flags.json {
                cmd.push("--json".to_string());
            }
            if flags.skip_git_repo_check {
                cmd.push("--skip-git-repo-check".to_string());
            }
        }
        CommandKind::Resume => {
            let resume = &invocation.resume;
            if resume.last {
                cmd.push("--last".to_string());
            }
            if resume.all {
                cmd.push("--all".to_string());
            }
            let session_id = resume.session_id.trim();
            if !session_id.is_empty() {
                cmd.push(session_id.to_string());
            }
        }
        CommandKind::Chat => {}
    }

    cmd.extend(mcp_overrides(invocation)?);
    cmd.extend(passthrough.iter().cloned());

    // exec output is plain text; under the green theme it must not carry its own colors.
    if kind == CommandKind::Exec
        && settings.terminal_theme == TerminalTheme::Green
        && !has_color_flag(passthrough)
    {
        push_flag_value(&mut cmd, "--color", "never");
    }

    let prompt = prompt.trim();
    if !prompt.is_empty() {
        cmd.push(prompt.to_string());
    }
    Ok(cmd)
}

fn wrap_with_docker_exec(invocation: &Invocation, inner: Vec<String>) -> Result<Vec<String>, CosError> {
    let settings = &invocation.settings;
    let container = settings.docker_container.trim();
    if container.is_empty() {
        return Err(CosError::Usage(
            "Docker backend requires a non-empty docker container name.".to_string(),
        ));
    }
    invocation.ensure_terminal_available()?;

    let mut cmd = vec![
        CONTAINER_RUNTIME_BINARY.to_string(),
        "exec".to_string(),
        "-i".to_string(),
    ];
    if invocation.kind.is_interactive() {
        cmd.push("-t".to_string());
    }
    let home = invocation.container_home.trim();
    if !home.is_empty() {
        push_flag_value(&mut cmd, "-e", &format!("HOME={home}"));
    }
    let workdir = settings.docker_workdir.trim();
    if !workdir.is_empty() {
        push_flag_value(&mut cmd, "-w", workdir);
    }
    cmd.push(container.to_string());
    cmd.extend(inner);
    Ok(cmd)
}

pub fn build_command(
    invocation: &Invocation,
    prompt: &str,
    passthrough: &[String],
) -> Result<CommandSpec, CosError> {
    let inner = build_agent_command(invocation, prompt, passthrough)?;
    let argv = match invocation.settings.codex_backend {
        Backend::Local => inner,
        Backend::Docker => wrap_with_docker_exec(invocation, inner)?,
    };

    let env_defaults = match invocation.settings.terminal_theme {
        TerminalTheme::Green => NO_COLOR_ENV_DEFAULTS
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        TerminalTheme::Default => BTreeMap::new(),
    };
    debug!(
        kind = %invocation.kind,
        backend = %invocation.settings.codex_backend,
        args = argv.len(),
        "built agent command"
    );
    Ok(CommandSpec { argv, env_defaults })
}
