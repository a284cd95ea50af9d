mod command;
mod config;
mod doctor;
mod error;
mod preflight;
mod prompt;
mod relay;
mod report;
mod runner;

use clap::{Args, Parser, Subcommand};
use command::{build_command, normalize_passthrough, CommandKind, Invocation, ResumeTarget, RunFlags};
use config::{
    resolve_effective_config, validate_config_files, Backend, ConfigEnvironment, ConfigKey,
    ConfigOverrides, Settings, CONFIG_PRECEDENCE,
};
use dialoguer::console::style;
use error::CosError;
use prompt::{compose_prompt, load_text_file, resolve_user_prompt, HiddenInstruction};
use report::{emit_checks, print_json};
use runner::{ProcessRunner, SystemRunner};
use std::env;
use std::io::{self, IsTerminal};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "COS_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "cos",
    version,
    about = "Run Codex with the application MCP server and COS instructions preconfigured"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an interactive Codex session.
    Chat {
        /// Optional initial prompt. Use '-' to read from stdin.
        #[arg(allow_hyphen_values = true)]
        prompt: Option<String>,
        #[command(flatten)]
        config: ConfigArgs,
        #[command(flatten)]
        agent: AgentArgs,
        /// Enable web search in the session.
        #[arg(long, default_value_t = false)]
        search: bool,
        /// Extra arguments forwarded to codex verbatim.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        passthrough: Vec<String>,
    },
    /// Run a single non-interactive Codex task.
    Exec {
        /// Task prompt. Use '-' to read from stdin.
        #[arg(allow_hyphen_values = true)]
        prompt: Option<String>,
        #[command(flatten)]
        config: ConfigArgs,
        #[command(flatten)]
        agent: AgentArgs,
        /// Emit JSONL events.
        #[arg(long, default_value_t = false)]
        json: bool,
        #[arg(long, default_value_t = false)]
        skip_git_repo_check: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        passthrough: Vec<String>,
    },
    /// Resume a previous Codex session.
    Resume {
        #[arg(allow_hyphen_values = true)]
        session_id: Option<String>,
        #[arg(allow_hyphen_values = true)]
        prompt: Option<String>,
        #[command(flatten)]
        config: ConfigArgs,
        #[command(flatten)]
        agent: AgentArgs,
        /// Resume the most recent session; cannot be combined with a session id.
        #[arg(long, default_value_t = false)]
        last: bool,
        /// Include sessions from every directory.
        #[arg(long, default_value_t = false)]
        all: bool,
        #[arg(long, default_value_t = false)]
        search: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        passthrough: Vec<String>,
    },
    /// Inspect COS configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Check the local environment, the container and the MCP endpoint.
    Doctor {
        #[arg(long, short = 'C')]
        repo: Option<String>,
        #[arg(long, value_parser = ["local", "docker"])]
        codex_backend: Option<String>,
        #[arg(long)]
        docker_container: Option<String>,
        #[arg(long)]
        docker_codex_binary: Option<String>,
        #[arg(long)]
        app_mcp_url: Option<String>,
        #[arg(long)]
        app_mcp_bearer_env: Option<String>,
        #[arg(long)]
        system_prompt_file: Option<String>,
        /// Network timeout used for MCP probes.
        #[arg(long, default_value_t = doctor::DEFAULT_PROBE_TIMEOUT_SECS)]
        timeout_seconds: f64,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Show the effective configuration and where each value came from.
    Show {
        #[arg(long, short = 'C')]
        repo: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Validate the global and local config files.
    Validate {
        #[arg(long, short = 'C')]
        repo: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// Repository directory passed to Codex with --cd.
    #[arg(long, short = 'C')]
    repo: Option<String>,
    #[arg(long, short = 'm')]
    model: Option<String>,
    #[arg(long, value_parser = ["read-only", "workspace-write", "danger-full-access"])]
    sandbox: Option<String>,
    #[arg(long, value_parser = ["untrusted", "on-request", "never"])]
    approval: Option<String>,
    #[arg(long, value_parser = ["default", "green"])]
    terminal_theme: Option<String>,
    #[arg(long, value_parser = ["local", "docker"])]
    codex_backend: Option<String>,
    #[arg(long)]
    docker_container: Option<String>,
    #[arg(long)]
    docker_workdir: Option<String>,
    #[arg(long)]
    docker_codex_binary: Option<String>,
    #[arg(long)]
    docker_codex_home_root: Option<String>,
    #[arg(long)]
    app_mcp_name: Option<String>,
    #[arg(long)]
    app_mcp_url: Option<String>,
    #[arg(long)]
    app_mcp_bearer_env: Option<String>,
    #[arg(long)]
    system_prompt_file: Option<String>,
}

impl ConfigArgs {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::default();
        for (key, value) in [
            (ConfigKey::Repo, &self.repo),
            (ConfigKey::Model, &self.model),
            (ConfigKey::Sandbox, &self.sandbox),
            (ConfigKey::Approval, &self.approval),
            (ConfigKey::TerminalTheme, &self.terminal_theme),
            (ConfigKey::CodexBackend, &self.codex_backend),
            (ConfigKey::DockerContainer, &self.docker_container),
            (ConfigKey::DockerWorkdir, &self.docker_workdir),
            (ConfigKey::DockerCodexBinary, &self.docker_codex_binary),
            (ConfigKey::DockerCodexHomeRoot, &self.docker_codex_home_root),
            (ConfigKey::AppMcpName, &self.app_mcp_name),
            (ConfigKey::AppMcpUrl, &self.app_mcp_url),
            (ConfigKey::AppMcpBearerEnv, &self.app_mcp_bearer_env),
            (ConfigKey::SystemPromptFile, &self.system_prompt_file),
        ] {
            overrides.set(key, value.clone());
        }
        overrides
    }
}

#[derive(Args, Debug, Default)]
struct AgentArgs {
    /// Bypass approvals and sandbox (codex --dangerously-bypass-approvals-and-sandbox).
    #[arg(long, default_value_t = false)]
    dangerous: bool,
    /// Do not inject the application MCP server.
    #[arg(long, default_value_t = false)]
    no_app_mcp: bool,
}

struct AgentRequest {
    kind: CommandKind,
    prompt: String,
    config: ConfigArgs,
    flags: RunFlags,
    resume: ResumeTarget,
    passthrough: Vec<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("error"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let runner = SystemRunner;

    let result = match cli.command {
        Commands::Chat {
            mut prompt,
            config,
            agent,
            search,
            passthrough,
        } => {
            let passthrough = forward_unknown_options(&mut [&mut prompt], passthrough);
            handle_agent(
                AgentRequest {
                    kind: CommandKind::Chat,
                    prompt: prompt.unwrap_or_default(),
                    config,
                    flags: RunFlags {
                        dangerous: agent.dangerous,
                        no_app_mcp: agent.no_app_mcp,
                        search,
                        ..RunFlags::default()
                    },
                    resume: ResumeTarget::default(),
                    passthrough,
                },
                &runner,
            )
        }
        Commands::Exec {
            mut prompt,
            config,
            agent,
            json,
            skip_git_repo_check,
            passthrough,
        } => {
            let passthrough = forward_unknown_options(&mut [&mut prompt], passthrough);
            handle_agent(
                AgentRequest {
                    kind: CommandKind::Exec,
                    prompt: prompt.unwrap_or_default(),
                    config,
                    flags: RunFlags {
                        dangerous: agent.dangerous,
                        no_app_mcp: agent.no_app_mcp,
                        json,
                        skip_git_repo_check,
                        ..RunFlags::default()
                    },
                    resume: ResumeTarget::default(),
                    passthrough,
                },
                &runner,
            )
        }
        Commands::Resume {
            mut session_id,
            mut prompt,
            config,
            agent,
            last,
            all,
            search,
            passthrough,
        } => {
            let passthrough =
                forward_unknown_options(&mut [&mut session_id, &mut prompt], passthrough);
            resume_target(session_id, last, all).and_then(|resume| {
                handle_agent(
                    AgentRequest {
                        kind: CommandKind::Resume,
                        prompt: prompt.unwrap_or_default(),
                        config,
                        flags: RunFlags {
                            dangerous: agent.dangerous,
                            no_app_mcp: agent.no_app_mcp,
                            search,
                            ..RunFlags::default()
                        },
                        resume,
                        passthrough,
                    },
                    &runner,
                )
            })
        }
        Commands::Config { command } => handle_config(command),
        Commands::Doctor {
            repo,
            codex_backend,
            docker_container,
            docker_codex_binary,
            app_mcp_url,
            app_mcp_bearer_env,
            system_prompt_file,
            timeout_seconds,
            json,
        } => {
            let mut overrides = ConfigOverrides::default();
            overrides.set(ConfigKey::CodexBackend, codex_backend);
            overrides.set(ConfigKey::DockerContainer, docker_container);
            overrides.set(ConfigKey::DockerCodexBinary, docker_codex_binary);
            overrides.set(ConfigKey::AppMcpUrl, app_mcp_url);
            overrides.set(ConfigKey::AppMcpBearerEnv, app_mcp_bearer_env);
            overrides.set(ConfigKey::SystemPromptFile, system_prompt_file);
            handle_doctor(repo.as_deref(), &overrides, timeout_seconds, json, &runner)
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn is_forwarded_option(value: &str) -> bool {
    value.len() > 1 && value.starts_with('-') && !value.contains(char::is_whitespace)
}

/// Codex options cos does not know land in the first open positional slot. That slot
/// and every later one belong to the forwarded arguments.
fn forward_unknown_options(
    slots: &mut [&mut Option<String>],
    passthrough: Vec<String>,
) -> Vec<String> {
    let Some(first) = slots
        .iter()
        .position(|slot| slot.as_deref().is_some_and(is_forwarded_option))
    else {
        return passthrough;
    };
    let mut forwarded: Vec<String> = slots[first..]
        .iter_mut()
        .filter_map(|slot| slot.take())
        .collect();
    forwarded.extend(passthrough);
    forwarded
}

fn resume_target(session_id: Option<String>, last: bool, all: bool) -> Result<ResumeTarget, CosError> {
    let session_id = session_id.unwrap_or_default();
    if last && !session_id.trim().is_empty() {
        return Err(CosError::Usage(
            "`--last` cannot be used with an explicit session id.".to_string(),
        ));
    }
    Ok(ResumeTarget {
        session_id,
        last,
        all,
    })
}

fn handle_agent(request: AgentRequest, runner: &dyn ProcessRunner) -> Result<i32, CosError> {
    let AgentRequest {
        kind,
        prompt,
        config,
        mut flags,
        resume,
        passthrough,
    } = request;

    let environment = ConfigEnvironment::capture()?;
    let resolved =
        resolve_effective_config(&environment, config.repo.as_deref(), &config.overrides())?;
    let mut settings = Settings::from_resolved(&resolved)?;
    if settings.codex_backend == Backend::Local && !settings.repo.is_empty() {
        settings.repo = environment.expand_path(&settings.repo).display().to_string();
    }

    let user_prompt = resolve_user_prompt(&prompt, true, io::stdin().lock())?;
    if kind == CommandKind::Exec && user_prompt.is_empty() {
        return Err(CosError::Usage(
            "`cos exec` requires a prompt (argument or stdin via '-').".to_string(),
        ));
    }

    let interactive_tty = io::stdin().is_terminal() && io::stdout().is_terminal();
    let mut invocation = Invocation {
        kind,
        settings,
        flags: RunFlags::default(),
        resume,
        container_home: String::new(),
        interactive_tty,
    };
    invocation.ensure_terminal_available()?;

    let settings = &invocation.settings;
    let extra_system_prompt =
        load_text_file(&environment.expand_path(settings.system_prompt_file.trim()))?;

    let wrapped_prompt = if kind == CommandKind::Resume {
        user_prompt
    } else {
        let workspace_id = preflight::detect_workspace_id(settings, &environment, runner);
        let hidden = HiddenInstruction {
            app_mcp_name: &settings.app_mcp_name,
            app_mcp_url: &settings.app_mcp_url,
            extra_system_prompt: &extra_system_prompt,
            has_user_prompt: !user_prompt.is_empty(),
            runtime_workspace_id: &workspace_id,
        }
        .build();
        compose_prompt(&hidden, &user_prompt)
    };

    let docker = settings.codex_backend == Backend::Docker;
    if kind == CommandKind::Exec && docker {
        flags.skip_git_repo_check = true;
    }
    if kind == CommandKind::Resume && docker && !invocation.resume.session_id.trim().is_empty() {
        invocation.container_home = preflight::find_docker_resume_home(
            runner,
            &settings.docker_container,
            &invocation.resume.session_id,
            &settings.docker_codex_home_root,
        )
        .unwrap_or_else(|err| {
            warn!(error = %err, "docker resume home lookup failed");
            String::new()
        });
    }
    invocation.flags = flags;

    preflight::ensure_runtime_ready(&invocation.settings, runner)?;
    let spec = build_command(
        &invocation,
        &wrapped_prompt,
        &normalize_passthrough(passthrough),
    )?;
    debug!(kind = %kind, program = spec.program(), "starting agent");
    relay::run_agent(&spec, invocation.settings.terminal_theme)
}

fn handle_config(command: ConfigCommand) -> Result<i32, CosError> {
    let environment = ConfigEnvironment::capture()?;
    match command {
        ConfigCommand::Show { repo, json } => {
            let resolved =
                resolve_effective_config(&environment, repo.as_deref(), &ConfigOverrides::default())?;
            if json {
                print_json(&resolved.to_json())?;
                return Ok(0);
            }
            println!("{}", style("COS config (effective)").bold());
            println!("Precedence: {CONFIG_PRECEDENCE}");
            println!();
            for key in ConfigKey::ALL {
                println!(
                    "- {}: {:?} (source: {})",
                    key.name(),
                    resolved.value(key),
                    style(resolved.source(key).as_str()).dim()
                );
            }
            println!();
            for (label, file) in [("global", &resolved.global), ("local", &resolved.local)] {
                println!(
                    "- {label} config: {} (exists={})",
                    file.path.display(),
                    file.exists
                );
                if !file.unknown_keys.is_empty() {
                    println!(
                        "  {} {}",
                        style("unknown keys:").yellow(),
                        file.unknown_keys.join(", ")
                    );
                }
            }
            Ok(0)
        }
        ConfigCommand::Validate { repo, json } => {
            let checks = validate_config_files(&environment, repo.as_deref());
            emit_checks("COS config validation", &checks, json)
        }
    }
}

fn handle_doctor(
    repo: Option<&str>,
    overrides: &ConfigOverrides,
    timeout_seconds: f64,
    json: bool,
    runner: &dyn ProcessRunner,
) -> Result<i32, CosError> {
    let environment = ConfigEnvironment::capture()?;
    let resolved = resolve_effective_config(&environment, repo, overrides)?;
    let settings = Settings::from_resolved(&resolved)?;
    let host_var = |name: &str| env::var(name).ok();
    let ctx = doctor::DoctorContext {
        settings: &settings,
        environment: &environment,
        runner,
        timeout: doctor::probe_timeout(timeout_seconds),
        host_var: &host_var,
    };
    let checks = doctor::collect_doctor_checks(&ctx);
    emit_checks("COS doctor", &checks, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn resume_last_conflicts_with_session_id() {
        let err = resume_target(Some("abc".to_string()), true, false).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("cannot be used with"));

        let target = resume_target(None, true, true).unwrap();
        assert!(target.last && target.all && target.session_id.is_empty());
    }

    fn parse_chat(args: &[&str]) -> (Option<String>, Vec<String>) {
        let cli = Cli::try_parse_from(["cos", "chat"].iter().chain(args)).unwrap();
        let Commands::Chat {
            mut prompt,
            passthrough,
            ..
        } = cli.command
        else {
            panic!("expected chat");
        };
        let passthrough = forward_unknown_options(&mut [&mut prompt], passthrough);
        (prompt, passthrough)
    }

    #[test]
    fn unknown_leading_option_is_forwarded_without_separator() {
        let (prompt, passthrough) = parse_chat(&["--profile", "fast"]);
        assert_eq!(prompt, None);
        assert_eq!(passthrough, vec!["--profile", "fast"]);
    }

    #[test]
    fn known_options_still_parse_around_forwarded_ones() {
        let cli = Cli::try_parse_from(["cos", "chat", "-m", "o3", "hi", "--profile", "fast"]).unwrap();
        let Commands::Chat {
            mut prompt,
            config,
            passthrough,
            ..
        } = cli.command
        else {
            panic!("expected chat");
        };
        let passthrough = forward_unknown_options(&mut [&mut prompt], passthrough);
        assert_eq!(config.model.as_deref(), Some("o3"));
        assert_eq!(prompt.as_deref(), Some("hi"));
        assert_eq!(passthrough, vec!["--profile", "fast"]);
    }

    #[test]
    fn stdin_marker_and_prose_stay_prompts() {
        assert_eq!(parse_chat(&["-"]).0.as_deref(), Some("-"));
        assert_eq!(
            parse_chat(&["-- list the files"]).0.as_deref(),
            Some("-- list the files")
        );
    }

    #[test]
    fn resume_forwards_option_in_session_slot() {
        let cli = Cli::try_parse_from(["cos", "resume", "--last", "--profile", "fast"]).unwrap();
        let Commands::Resume {
            mut session_id,
            mut prompt,
            last,
            passthrough,
            ..
        } = cli.command
        else {
            panic!("expected resume");
        };
        let passthrough =
            forward_unknown_options(&mut [&mut session_id, &mut prompt], passthrough);
        assert!(last);
        assert_eq!((session_id, prompt), (None, None));
        assert_eq!(passthrough, vec!["--profile", "fast"]);
        assert!(resume_target(None, last, false).is_ok());
    }

    #[test]
    fn exec_collects_prompt_and_passthrough() {
        let cli = Cli::try_parse_from([
            "cos",
            "exec",
            "fix bug",
            "--model",
            "o3",
            "--json",
            "--",
            "--profile",
            "fast",
        ])
        .unwrap();
        let Commands::Exec {
            prompt,
            config,
            json,
            passthrough,
            ..
        } = cli.command
        else {
            panic!("expected exec");
        };
        assert_eq!(prompt.as_deref(), Some("fix bug"));
        assert_eq!(config.model.as_deref(), Some("o3"));
        assert!(json);
        assert_eq!(normalize_passthrough(passthrough), vec!["--profile", "fast"]);
    }

    #[test]
    fn enumerated_options_reject_unknown_values() {
        let err = Cli::try_parse_from(["cos", "chat", "--sandbox", "bogus"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn config_args_skip_unset_and_blank_values() {
        let args = ConfigArgs {
            model: Some("o3".to_string()),
            repo: Some("  ".to_string()),
            ..ConfigArgs::default()
        };
        let overrides = args.overrides();
        let keys: Vec<ConfigKey> = overrides.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![ConfigKey::Model]);
    }
}
