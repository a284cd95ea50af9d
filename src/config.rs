//! Layered configuration: defaults, `~/.cos/config.toml`, `<repo>/.cos/config.toml`,
//! `COS_*` environment variables and CLI options, in increasing priority.

use crate::error::CosError;
use crate::report::Check;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

pub const CONFIG_PRECEDENCE: &str =
    "default < global config < local config < environment < CLI option";
pub const WORKSPACE_SCOPE_ENV_KEYS: [&str; 2] = ["COS_WORKSPACE_ID", "MCP_DEFAULT_WORKSPACE_ID"];

const CONFIG_SECTION: &str = "cos";
const CONFIG_DIR_NAME: &str = ".cos";
const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_PREFIX: &str = "COS_";

macro_rules! config_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Accepted spellings, sorted.
            pub const ALLOWED: &'static [&'static str] = &[$($text),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = CosError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(CosError::Config(format!(
                        "invalid value {other:?}. Allowed: {}.",
                        Self::ALLOWED.join(", ")
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

config_enum!(
    /// Sandbox policy forwarded to the agent.
    Sandbox {
        DangerFullAccess => "danger-full-access",
        ReadOnly => "read-only",
        WorkspaceWrite => "workspace-write",
    }
);

config_enum!(
    /// Approval policy forwarded to the agent for interactive sessions.
    Approval {
        Never => "never",
        OnRequest => "on-request",
        Untrusted => "untrusted",
    }
);

config_enum!(
    TerminalTheme {
        Default => "default",
        Green => "green",
    }
);

config_enum!(
    /// Where the agent runs: on this host or inside a running container.
    Backend {
        Docker => "docker",
        Local => "local",
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigKey {
    Repo,
    Model,
    Sandbox,
    Approval,
    TerminalTheme,
    CodexBackend,
    DockerContainer,
    DockerWorkdir,
    DockerCodexBinary,
    DockerAppMcpUrl,
    DockerCodexHomeRoot,
    AppMcpName,
    AppMcpUrl,
    AppMcpBearerEnv,
    SystemPromptFile,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 15] = [
        ConfigKey::Repo,
        ConfigKey::Model,
        ConfigKey::Sandbox,
        ConfigKey::Approval,
        ConfigKey::TerminalTheme,
        ConfigKey::CodexBackend,
        ConfigKey::DockerContainer,
        ConfigKey::DockerWorkdir,
        ConfigKey::DockerCodexBinary,
        ConfigKey::DockerAppMcpUrl,
        ConfigKey::DockerCodexHomeRoot,
        ConfigKey::AppMcpName,
        ConfigKey::AppMcpUrl,
        ConfigKey::AppMcpBearerEnv,
        ConfigKey::SystemPromptFile,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::Repo => "repo",
            ConfigKey::Model => "model",
            ConfigKey::Sandbox => "sandbox",
            ConfigKey::Approval => "approval",
            ConfigKey::TerminalTheme => "terminal_theme",
            ConfigKey::CodexBackend => "codex_backend",
            ConfigKey::DockerContainer => "docker_container",
            ConfigKey::DockerWorkdir => "docker_workdir",
            ConfigKey::DockerCodexBinary => "docker_codex_binary",
            ConfigKey::DockerAppMcpUrl => "docker_app_mcp_url",
            ConfigKey::DockerCodexHomeRoot => "docker_codex_home_root",
            ConfigKey::AppMcpName => "app_mcp_name",
            ConfigKey::AppMcpUrl => "app_mcp_url",
            ConfigKey::AppMcpBearerEnv => "app_mcp_bearer_env",
            ConfigKey::SystemPromptFile => "system_prompt_file",
        }
    }

    pub fn env_var(self) -> &'static str {
        match self {
            ConfigKey::Repo => "COS_REPO",
            ConfigKey::Model => "COS_MODEL",
            ConfigKey::Sandbox => "COS_SANDBOX",
            ConfigKey::Approval => "COS_APPROVAL",
            ConfigKey::TerminalTheme => "COS_TERMINAL_THEME",
            ConfigKey::CodexBackend => "COS_CODEX_BACKEND",
            ConfigKey::DockerContainer => "COS_DOCKER_CONTAINER",
            ConfigKey::DockerWorkdir => "COS_DOCKER_WORKDIR",
            ConfigKey::DockerCodexBinary => "COS_DOCKER_CODEX_BINARY",
            ConfigKey::DockerAppMcpUrl => "COS_DOCKER_APP_MCP_URL",
            ConfigKey::DockerCodexHomeRoot => "COS_DOCKER_CODEX_HOME_ROOT",
            ConfigKey::AppMcpName => "COS_APP_MCP_NAME",
            ConfigKey::AppMcpUrl => "COS_APP_MCP_URL",
            ConfigKey::AppMcpBearerEnv => "COS_APP_MCP_BEARER_ENV",
            ConfigKey::SystemPromptFile => "COS_SYSTEM_PROMPT_FILE",
        }
    }

    pub fn default_value(self) -> &'static str {
        match self {
            ConfigKey::Repo => "",
            ConfigKey::Model => "",
            ConfigKey::Sandbox => "workspace-write",
            ConfigKey::Approval => "on-request",
            ConfigKey::TerminalTheme => "green",
            ConfigKey::CodexBackend => "docker",
            ConfigKey::DockerContainer => "task-app",
            ConfigKey::DockerWorkdir => "/app",
            ConfigKey::DockerCodexBinary => "codex",
            ConfigKey::DockerAppMcpUrl => "http://mcp-tools:8090/mcp",
            ConfigKey::DockerCodexHomeRoot => "/home/app/codex-home/workspace",
            ConfigKey::AppMcpName => "task-management-tools",
            ConfigKey::AppMcpUrl => "http://localhost:8091/mcp",
            ConfigKey::AppMcpBearerEnv => "",
            ConfigKey::SystemPromptFile => "~/.cos/system.md",
        }
    }

    fn allowed_values(self) -> Option<&'static [&'static str]> {
        match self {
            ConfigKey::Sandbox => Some(Sandbox::ALLOWED),
            ConfigKey::Approval => Some(Approval::ALLOWED),
            ConfigKey::TerminalTheme => Some(TerminalTheme::ALLOWED),
            ConfigKey::CodexBackend => Some(Backend::ALLOWED),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<ConfigKey> {
        ConfigKey::ALL.into_iter().find(|key| key.name() == name)
    }
}

/// Which layer supplied a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Default,
    GlobalConfig,
    LocalConfig,
    Env,
    Cli,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Default => "default",
            Source::GlobalConfig => "global_config",
            Source::LocalConfig => "local_config",
            Source::Env => "env",
            Source::Cli => "cli",
        }
    }
}

/// Snapshot of the process state that configuration depends on.
#[derive(Debug, Clone)]
pub struct ConfigEnvironment {
    pub home: PathBuf,
    pub cwd: PathBuf,
    pub vars: BTreeMap<String, String>,
}

impl ConfigEnvironment {
    pub fn capture() -> Result<Self, CosError> {
        let home = dirs::home_dir().ok_or_else(|| {
            CosError::Config("unable to determine home directory; set HOME".to_string())
        })?;
        let cwd = env::current_dir()?;
        let vars = env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .filter(|(key, _)| {
                key.starts_with(ENV_PREFIX) || WORKSPACE_SCOPE_ENV_KEYS.contains(&key.as_str())
            })
            .collect();
        Ok(Self { home, cwd, vars })
    }

    /// Trimmed value of a captured variable; empty values count as unset.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn expand_path(&self, input: &str) -> PathBuf {
        if input == "~" {
            return self.home.clone();
        }
        match input.strip_prefix("~/") {
            Some(stripped) => self.home.join(stripped),
            None => PathBuf::from(input),
        }
    }

    pub fn config_file_paths(&self, repo_hint: Option<&str>) -> (PathBuf, PathBuf) {
        let global = self.home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        let repo_root = match repo_hint.map(str::trim).filter(|hint| !hint.is_empty()) {
            Some(hint) => self.expand_path(hint),
            None => self.cwd.clone(),
        };
        let local = repo_root.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        (global, local)
    }
}

/// Explicit CLI values. Unset and blank values never override lower layers.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    values: BTreeMap<ConfigKey, String>,
}

impl ConfigOverrides {
    pub fn set(&mut self, key: ConfigKey, value: Option<String>) {
        if let Some(value) = value {
            if !value.trim().is_empty() {
                self.values.insert(key, value);
            }
        }
    }

    pub fn with(mut self, key: ConfigKey, value: &str) -> Self {
        self.set(key, Some(value.to_string()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConfigKey, &str)> {
        self.values.iter().map(|(key, value)| (*key, value.as_str()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigFileState {
    pub path: PathBuf,
    pub exists: bool,
    pub unknown_keys: Vec<String>,
}

impl ConfigFileState {
    fn new(path: PathBuf, layer: Option<&ConfigLayer>) -> Self {
        Self {
            path,
            exists: layer.is_some(),
            unknown_keys: layer
                .map(|layer| layer.unknown_keys.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    values: BTreeMap<ConfigKey, String>,
    sources: BTreeMap<ConfigKey, Source>,
    pub global: ConfigFileState,
    pub local: ConfigFileState,
}

impl ResolvedConfig {
    pub fn value(&self, key: ConfigKey) -> &str {
        self.values.get(&key).map(String::as_str).unwrap_or("")
    }

    pub fn source(&self, key: ConfigKey) -> Source {
        self.sources.get(&key).copied().unwrap_or(Source::Default)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let values: serde_json::Map<String, serde_json::Value> = ConfigKey::ALL
            .into_iter()
            .map(|key| (key.name().to_string(), json!(self.value(key))))
            .collect();
        let sources: serde_json::Map<String, serde_json::Value> = ConfigKey::ALL
            .into_iter()
            .map(|key| (key.name().to_string(), json!(self.source(key))))
            .collect();
        json!({
            "values": values,
            "sources": sources,
            "precedence": CONFIG_PRECEDENCE,
            "files": {
                "global_path": self.global.path,
                "global_exists": self.global.exists,
                "local_path": self.local.path,
                "local_exists": self.local.exists,
            },
            "unknown_keys": {
                "global": self.global.unknown_keys,
                "local": self.local.unknown_keys,
            },
        })
    }

    fn apply(&mut self, key: ConfigKey, value: String, source: Source) {
        self.values.insert(key, value);
        self.sources.insert(key, source);
    }
}

#[derive(Debug, Default)]
struct ConfigLayer {
    values: BTreeMap<ConfigKey, String>,
    unknown_keys: Vec<String>,
}

fn validate_value(key: ConfigKey, raw: &str, origin: &str) -> Result<String, CosError> {
    let value = raw.trim();
    if let Some(allowed) = key.allowed_values() {
        if !allowed.contains(&value) {
            return Err(CosError::Config(format!(
                "{origin}: invalid value for '{}' ({value:?}). Allowed: {}.",
                key.name(),
                allowed.join(", ")
            )));
        }
    }
    Ok(value.to_string())
}

fn parse_config_text(content: &str, origin: &str) -> Result<ConfigLayer, CosError> {
    let document: toml::Table = content
        .parse()
        .map_err(|err: toml::de::Error| {
            CosError::Config(format!("{origin}: invalid TOML: {}", err.message()))
        })?;
    let section = match document.get(CONFIG_SECTION) {
        Some(toml::Value::Table(section)) => section,
        Some(_) => {
            return Err(CosError::Config(format!(
                "{origin}: [{CONFIG_SECTION}] section must be a table."
            )))
        }
        None => &document,
    };

    let mut layer = ConfigLayer::default();
    for (name, raw) in section {
        let Some(key) = ConfigKey::from_name(name) else {
            layer.unknown_keys.push(name.clone());
            continue;
        };
        let toml::Value::String(text) = raw else {
            return Err(CosError::Config(format!(
                "{origin}: key '{name}' must be a string."
            )));
        };
        layer.values.insert(key, validate_value(key, text, origin)?);
    }
    Ok(layer)
}

fn load_config_file(path: &Path) -> Result<Option<ConfigLayer>, CosError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(CosError::Config(format!("{}: {err}", path.display()))),
    };
    if !metadata.is_file() {
        return Err(CosError::Config(format!(
            "{}: expected a regular file.",
            path.display()
        )));
    }
    let content = fs::read_to_string(path)
        .map_err(|err| CosError::Config(format!("{}: {err}", path.display())))?;
    parse_config_text(&content, &path.display().to_string()).map(Some)
}

pub fn resolve_effective_config(
    environment: &ConfigEnvironment,
    repo_hint: Option<&str>,
    overrides: &ConfigOverrides,
) -> Result<ResolvedConfig, CosError> {
    let (global_path, local_path) = environment.config_file_paths(repo_hint);
    let global_layer = load_config_file(&global_path)?;
    let local_layer = load_config_file(&local_path)?;

    let mut resolved = ResolvedConfig {
        values: ConfigKey::ALL
            .into_iter()
            .map(|key| (key, key.default_value().to_string()))
            .collect(),
        sources: ConfigKey::ALL
            .into_iter()
            .map(|key| (key, Source::Default))
            .collect(),
        global: ConfigFileState::new(global_path, global_layer.as_ref()),
        local: ConfigFileState::new(local_path, local_layer.as_ref()),
    };

    for (layer, source) in [
        (global_layer, Source::GlobalConfig),
        (local_layer, Source::LocalConfig),
    ] {
        let Some(layer) = layer else {
            continue;
        };
        for name in &layer.unknown_keys {
            debug!(key = %name, source = source.as_str(), "ignoring unknown config key");
        }
        for (key, value) in layer.values {
            resolved.apply(key, value, source);
        }
    }

    for key in ConfigKey::ALL {
        let env_name = key.env_var();
        if let Some(raw) = environment.var(env_name) {
            let value = validate_value(key, raw, &format!("environment variable {env_name}"))?;
            resolved.apply(key, value, Source::Env);
        }
    }

    for (key, raw) in overrides.iter() {
        let value = validate_value(key, raw, "CLI option")?;
        resolved.apply(key, value, Source::Cli);
    }

    debug!(
        global_exists = resolved.global.exists,
        local_exists = resolved.local.exists,
        "resolved configuration"
    );
    Ok(resolved)
}

/// Parses both config files without resolving, one record per finding.
pub fn validate_config_files(environment: &ConfigEnvironment, repo_hint: Option<&str>) -> Vec<Check> {
    let (global_path, local_path) = environment.config_file_paths(repo_hint);
    let mut checks = Vec::new();
    for (label, path) in [("global", global_path), ("local", local_path)] {
        let name = format!("{label}_config_file");
        match load_config_file(&path) {
            Ok(None) => checks.push(Check::ok(
                name,
                format!("Optional file not found: {}", path.display()),
            )),
            Ok(Some(layer)) => {
                checks.push(Check::ok(
                    name,
                    format!("Parsed successfully: {}", path.display()),
                ));
                for key in layer.unknown_keys {
                    checks.push(Check::warn(
                        format!("{label}_config_unknown_key"),
                        format!("Unknown key '{key}' in {}", path.display()),
                    ));
                }
            }
            Err(CosError::Config(message)) => checks.push(Check::fail(name, message)),
            Err(err) => checks.push(Check::fail(name, err.to_string())),
        }
    }
    checks
}

/// Typed view of a resolved configuration with backend-specific fallbacks applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub repo: String,
    pub model: String,
    pub sandbox: Sandbox,
    pub approval: Approval,
    pub terminal_theme: TerminalTheme,
    pub codex_backend: Backend,
    pub docker_container: String,
    pub docker_workdir: String,
    pub docker_codex_binary: String,
    pub docker_app_mcp_url: String,
    pub docker_codex_home_root: String,
    pub app_mcp_name: String,
    pub app_mcp_url: String,
    pub app_mcp_bearer_env: String,
    pub system_prompt_file: String,
}

impl Settings {
    pub fn from_resolved(resolved: &ResolvedConfig) -> Result<Self, CosError> {
        let text = |key: ConfigKey| resolved.value(key).to_string();
        let mut settings = Settings {
            repo: text(ConfigKey::Repo),
            model: text(ConfigKey::Model),
            sandbox: resolved.value(ConfigKey::Sandbox).parse()?,
            approval: resolved.value(ConfigKey::Approval).parse()?,
            terminal_theme: resolved.value(ConfigKey::TerminalTheme).parse()?,
            codex_backend: resolved.value(ConfigKey::CodexBackend).parse()?,
            docker_container: text(ConfigKey::DockerContainer),
            docker_workdir: text(ConfigKey::DockerWorkdir),
            docker_codex_binary: text(ConfigKey::DockerCodexBinary),
            docker_app_mcp_url: text(ConfigKey::DockerAppMcpUrl),
            docker_codex_home_root: text(ConfigKey::DockerCodexHomeRoot),
            app_mcp_name: text(ConfigKey::AppMcpName),
            app_mcp_url: text(ConfigKey::AppMcpUrl),
            app_mcp_bearer_env: text(ConfigKey::AppMcpBearerEnv),
            system_prompt_file: text(ConfigKey::SystemPromptFile),
        };

        // Provenance decides, not the value: an explicit setting equal to the default still wins.
        if settings.codex_backend == Backend::Docker {
            if resolved.source(ConfigKey::AppMcpUrl) == Source::Default {
                settings.app_mcp_url = settings.docker_app_mcp_url.clone();
            }
            if resolved.source(ConfigKey::Repo) == Source::Default && settings.repo.is_empty() {
                settings.repo = settings.docker_workdir.clone();
            }
        }
        Ok(settings)
    }

    /// Agent binary name inside the container.
    pub fn container_agent_binary(&self) -> &str {
        match self.docker_codex_binary.trim() {
            "" => crate::command::AGENT_BINARY,
            binary => binary,
        }
    }
}
