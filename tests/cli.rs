use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("cos");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

struct Sandbox {
    _dir: TempDir,
    home: PathBuf,
    repo: PathBuf,
    bin_dir: PathBuf,
}

fn sandbox() -> Sandbox {
    let dir = tempdir().unwrap();
    let home = dir.path().join("home");
    let repo = dir.path().join("repo");
    let bin_dir = dir.path().join("bin");
    for path in [&home, &repo, &bin_dir] {
        fs::create_dir_all(path).unwrap();
    }
    Sandbox {
        _dir: dir,
        home,
        repo,
        bin_dir,
    }
}

impl Sandbox {
    /// Runs `cos` with only HOME and PATH set, from inside the repo.
    fn cos(&self) -> Command {
        let mut cmd = bin();
        cmd.env_clear()
            .env("HOME", &self.home)
            .env("PATH", &self.bin_dir)
            .current_dir(&self.repo);
        cmd
    }

    /// Same environment as [`Sandbox::cos`], as a plain process for terminal runs.
    #[cfg(unix)]
    fn terminal_cos(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(assert_cmd::cargo::cargo_bin!("cos"));
        cmd.env_clear()
            .env("HOME", &self.home)
            .env("PATH", &self.bin_dir)
            .current_dir(&self.repo);
        cmd
    }

    fn write_global_config(&self, content: &str) {
        write_config(&self.home, content);
    }

    fn write_local_config(&self, content: &str) {
        write_config(&self.repo, content);
    }
}

fn write_config(root: &Path, content: &str) {
    let dir = root.join(".cos");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.toml"), content).unwrap();
}

#[cfg(unix)]
fn install_script(bin_dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    let script = bin_dir.join(name);
    fs::write(&script, body).unwrap();
    let mut permissions = fs::metadata(&script).unwrap().permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&script, permissions).unwrap();
}

#[cfg(unix)]
fn install_fake_codex(bin_dir: &Path) {
    install_script(
        bin_dir,
        "codex",
        "#!/bin/sh\nfor arg in \"$@\"; do printf '%s\\0' \"$arg\"; done > \"$COS_TEST_ARGS_FILE\"\nprintf '%s' \"${NO_COLOR:-unset}\" > \"$COS_TEST_ARGS_FILE.env\"\n",
    );
}

/// Answers the runtime probes like a running `task-app` container and records the
/// final agent invocation, which exits 4.
#[cfg(unix)]
fn install_fake_docker(bin_dir: &Path) {
    install_script(
        bin_dir,
        "docker",
        r#"#!/bin/sh
if [ "$1" = inspect ]; then
  echo true
  exit 0
fi
if [ "$1" = exec ] && [ "$2" != -i ]; then
  case "$3" in
    env) printf 'HOSTNAME=task-app\nCOS_WORKSPACE_ID=ws-9\n' ;;
    sh) printf '%s\n' "$COS_TEST_SESSION_LOG" ;;
    *) echo 'codex-cli 0.1.0' ;;
  esac
  exit 0
fi
for arg in "$@"; do printf '%s\0' "$arg"; done > "$COS_TEST_ARGS_FILE"
exit 4
"#,
    );
}

#[cfg(unix)]
fn recorded_args(path: &Path) -> Vec<String> {
    let raw = fs::read(path).expect("fake codex was invoked");
    raw.split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8(part.to_vec()).unwrap())
        .collect()
}

#[test]
fn version_flag_prints_package_version() {
    bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains(format!("cos {}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn exec_without_prompt_is_a_usage_error() {
    let sb = sandbox();
    sb.cos()
        .args(["exec", "--codex-backend", "local"])
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(contains("requires a prompt"));
}

#[test]
fn resume_rejects_last_with_session_id() {
    let sb = sandbox();
    sb.cos()
        .args(["resume", "--last", "abc"])
        .assert()
        .code(2)
        .stderr(contains("cannot be used with"));
}

#[test]
fn docker_chat_without_terminal_fails_before_spawning() {
    let sb = sandbox();
    sb.cos()
        .args(["chat", "hello"])
        .assert()
        .code(2)
        .stderr(contains("interactive TTY terminal"));
}

#[test]
fn invalid_environment_value_is_reported_with_its_variable() {
    let sb = sandbox();
    sb.cos()
        .env("COS_SANDBOX", "bogus")
        .args(["exec", "do it"])
        .assert()
        .code(2)
        .stderr(contains("COS_SANDBOX"))
        .stderr(contains("danger-full-access, read-only, workspace-write"));
}

#[test]
fn missing_local_codex_is_a_runtime_error() {
    let sb = sandbox();
    sb.cos()
        .args(["exec", "do it", "--codex-backend", "local"])
        .assert()
        .code(1)
        .stderr(contains("`codex` binary is not available in PATH"));
}

#[test]
fn config_show_reports_values_and_sources() {
    let sb = sandbox();
    sb.write_global_config("[cos]\nsandbox = \"read-only\"\n");
    sb.write_local_config("model = \"o3\"\nmystery = \"x\"\n");

    let output = sb
        .cos()
        .env("COS_APPROVAL", "never")
        .args(["config", "show", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert_eq!(value["values"]["sandbox"], "read-only");
    assert_eq!(value["sources"]["sandbox"], "global_config");
    assert_eq!(value["values"]["model"], "o3");
    assert_eq!(value["sources"]["model"], "local_config");
    assert_eq!(value["sources"]["approval"], "env");
    assert_eq!(value["sources"]["repo"], "default");
    assert_eq!(
        value["precedence"],
        "default < global config < local config < environment < CLI option"
    );
    assert_eq!(value["files"]["global_exists"], true);
    assert_eq!(value["unknown_keys"]["local"][0], "mystery");
}

#[test]
fn config_show_human_output_lists_every_key() {
    let sb = sandbox();
    sb.cos()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains("COS config (effective)"))
        .stdout(contains("- terminal_theme: \"green\" (source: default)"))
        .stdout(contains("- docker_codex_home_root:"));
}

#[test]
fn config_validate_warns_on_unknown_key() {
    let sb = sandbox();
    sb.write_global_config("[cos]\nunknown_key = \"value\"\n");

    let output = sb
        .cos()
        .args(["config", "validate", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert_eq!(value["summary"]["warn"], 1);
    assert_eq!(value["summary"]["fail"], 0);
    let checks = value["checks"].as_array().unwrap();
    assert!(checks
        .iter()
        .any(|check| check["name"] == "global_config_unknown_key" && check["status"] == "warn"));
}

#[test]
fn config_validate_fails_on_invalid_values() {
    let sb = sandbox();
    sb.write_local_config("[cos]\nterminal_theme = \"neon\"\n");

    sb.cos()
        .args(["config", "validate"])
        .assert()
        .code(1)
        .stdout(contains("COS config validation"))
        .stdout(contains("local_config_file"))
        .stdout(contains("Summary: ok=1 warn=0 fail=1"));
}

#[test]
fn config_validate_honours_repo_option() {
    let sb = sandbox();
    let other = sb.home.join("elsewhere");
    write_config(&other, "[cos]\ncodex_backend = \"podman\"\n");

    let output = sb
        .cos()
        .args(["config", "validate", "--json", "-C"])
        .arg(&other)
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert_eq!(value["summary"]["fail"], 1);
}

#[test]
fn doctor_reports_missing_codex_on_local_backend() {
    let sb = sandbox();
    let output = sb
        .cos()
        .args([
            "doctor",
            "--codex-backend",
            "local",
            "--app-mcp-url",
            "ftp://nowhere",
            "--json",
        ])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    let checks = value["checks"].as_array().unwrap();
    let status = |name: &str| {
        checks
            .iter()
            .find(|check| check["name"] == name)
            .map(|check| check["status"].as_str().unwrap().to_string())
    };
    assert_eq!(status("cos").as_deref(), Some("ok"));
    assert_eq!(status("codex_path").as_deref(), Some("fail"));
    assert_eq!(status("mcp_url").as_deref(), Some("fail"));
    assert_eq!(status("system_prompt_file").as_deref(), Some("warn"));
    assert_eq!(status("mcp_tcp"), None);
}

#[cfg(unix)]
#[test]
fn exec_reads_prompt_from_stdin_and_composes_it() {
    let sb = sandbox();
    install_fake_codex(&sb.bin_dir);
    let args_file = sb.repo.join("args.bin");

    sb.cos()
        .env("COS_TEST_ARGS_FILE", &args_file)
        .args(["exec", "-", "--codex-backend", "local"])
        .write_stdin("fix bug\n")
        .assert()
        .success();

    let args = recorded_args(&args_file);
    assert_eq!(args[0], "exec");
    let prompt = args.last().unwrap();
    assert!(prompt.starts_with("COS wrapper runtime instructions:"));
    assert!(prompt.ends_with("\n\nUser request:\nfix bug"));
    assert_eq!(&args[args.len() - 3..args.len() - 1], ["--color", "never"]);
    assert!(args
        .iter()
        .any(|arg| arg == "mcp_servers.task-management-tools.url=\"http://localhost:8091/mcp\""));
    assert!(!args.contains(&"--skip-git-repo-check".to_string()));

    let no_color = fs::read_to_string(sb.repo.join("args.bin.env")).unwrap();
    assert_eq!(no_color, "1");
}

#[cfg(unix)]
#[test]
fn exec_forwards_passthrough_and_respects_explicit_color() {
    let sb = sandbox();
    install_fake_codex(&sb.bin_dir);
    sb.write_local_config("[cos]\ncodex_backend = \"local\"\nterminal_theme = \"default\"\n");
    let args_file = sb.repo.join("args.bin");

    sb.cos()
        .env("COS_TEST_ARGS_FILE", &args_file)
        .args([
            "exec",
            "ship it",
            "--no-app-mcp",
            "-m",
            "o3",
            "--",
            "--profile",
            "fast",
        ])
        .assert()
        .success();

    let args = recorded_args(&args_file);
    let model = args.iter().position(|arg| arg == "-m").unwrap();
    assert_eq!(args[model + 1], "o3");
    assert!(!args.contains(&"-c".to_string()));
    assert!(!args.contains(&"--color".to_string()));
    let profile = args.iter().position(|arg| arg == "--profile").unwrap();
    assert_eq!(args[profile + 1], "fast");
    assert_eq!(profile + 3, args.len());

    let no_color = fs::read_to_string(sb.repo.join("args.bin.env")).unwrap();
    assert_eq!(no_color, "unset");
}

#[cfg(unix)]
#[test]
fn agent_exit_code_is_passed_through() {
    let sb = sandbox();
    install_script(&sb.bin_dir, "codex", "#!/bin/sh\nexit 7\n");

    sb.cos()
        .args(["exec", "anything", "--codex-backend", "local"])
        .assert()
        .code(7);
}

#[cfg(unix)]
#[test]
fn chat_forwards_unknown_options_without_separator() {
    let sb = sandbox();
    install_fake_codex(&sb.bin_dir);
    let args_file = sb.repo.join("args.bin");

    sb.cos()
        .env("COS_TEST_ARGS_FILE", &args_file)
        .args(["chat", "--codex-backend", "local", "--profile", "fast"])
        .assert()
        .success();

    let args = recorded_args(&args_file);
    let profile = args.iter().position(|arg| arg == "--profile").unwrap();
    assert_eq!(args[profile + 1], "fast");
    assert_eq!(profile + 3, args.len());
    assert!(args
        .last()
        .unwrap()
        .starts_with("COS wrapper runtime instructions:"));
}

#[cfg(unix)]
#[test]
fn docker_exec_runs_codex_inside_the_container() {
    let sb = sandbox();
    install_fake_docker(&sb.bin_dir);
    let args_file = sb.repo.join("args.bin");

    sb.cos()
        .env("COS_TEST_ARGS_FILE", &args_file)
        .args(["exec", "do it"])
        .assert()
        .code(4);

    let args = recorded_args(&args_file);
    assert_eq!(
        &args[..args.len() - 1],
        [
            "exec",
            "-i",
            "-w",
            "/app",
            "task-app",
            "codex",
            "exec",
            "--cd",
            "/app",
            "--sandbox",
            "workspace-write",
            "--skip-git-repo-check",
            "-c",
            "mcp_servers.task-management-tools.url=\"http://mcp-tools:8090/mcp\"",
            "-c",
            "mcp_servers.task-management-tools.enabled=true",
            "--color",
            "never",
        ]
    );
    let prompt = args.last().unwrap();
    assert!(prompt.contains("Active workspace_id: ws-9"));
    assert!(prompt.ends_with("User request:\ndo it"));
}

#[cfg(unix)]
#[test]
fn docker_exec_keeps_explicit_repo_and_mcp_url() {
    let sb = sandbox();
    install_fake_docker(&sb.bin_dir);
    let args_file = sb.repo.join("args.bin");

    sb.cos()
        .env("COS_TEST_ARGS_FILE", &args_file)
        .args([
            "exec",
            "do it",
            "-C",
            "/srv/project",
            "--app-mcp-url",
            "http://tools:9000/mcp",
        ])
        .assert()
        .code(4);

    let args = recorded_args(&args_file);
    let cd = args.iter().position(|arg| arg == "--cd").unwrap();
    assert_eq!(args[cd + 1], "/srv/project");
    assert!(args
        .iter()
        .any(|arg| arg == "mcp_servers.task-management-tools.url=\"http://tools:9000/mcp\""));
}

#[cfg(unix)]
fn contains_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(unix)]
mod terminal {
    use std::fs::File;
    use std::io::{self, Read};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::process::{Command, ExitStatus, Stdio};
    use std::thread;

    /// The termios fields raw mode rewrites.
    #[derive(Debug, PartialEq, Eq)]
    pub struct Mode {
        iflag: libc::tcflag_t,
        oflag: libc::tcflag_t,
        cflag: libc::tcflag_t,
        lflag: libc::tcflag_t,
        cc: Vec<libc::cc_t>,
    }

    fn mode(fd: &OwnedFd) -> Mode {
        let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
        assert_eq!(unsafe { libc::tcgetattr(fd.as_raw_fd(), &mut termios) }, 0);
        Mode {
            iflag: termios.c_iflag,
            oflag: termios.c_oflag,
            cflag: termios.c_cflag,
            lflag: termios.c_lflag,
            cc: termios.c_cc.to_vec(),
        }
    }

    fn set_cloexec(fd: &OwnedFd) {
        assert!(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } >= 0);
    }

    pub struct Run {
        pub status: ExitStatus,
        pub output: Vec<u8>,
        pub stderr: String,
        pub mode_before: Mode,
        pub mode_after: Mode,
    }

    /// Runs `command` with a fresh `rows` x `cols` pty as its stdin and stdout and
    /// collects everything it wrote to the terminal.
    pub fn run(mut command: Command, rows: u16, cols: u16) -> Run {
        let mut master = -1;
        let mut slave = -1;
        let mut size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let result = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut size,
            )
        };
        assert_eq!(result, 0, "openpty failed");
        let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };
        set_cloexec(&master);
        set_cloexec(&slave);

        let mode_before = mode(&slave);
        command
            .stdin(Stdio::from(slave.try_clone().unwrap()))
            .stdout(Stdio::from(slave.try_clone().unwrap()))
            .stderr(Stdio::piped());
        let child = command.spawn().unwrap();
        drop(command);

        let mut reader = File::from(master);
        let collector = thread::spawn(move || {
            let mut output = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => output.extend_from_slice(&buffer[..count]),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    // EIO once the last slave handle is closed.
                    Err(_) => break,
                }
            }
            output
        });

        let finished = child.wait_with_output().unwrap();
        let mode_after = mode(&slave);
        drop(slave);
        Run {
            status: finished.status,
            output: collector.join().unwrap(),
            stderr: String::from_utf8_lossy(&finished.stderr).into_owned(),
            mode_before,
            mode_after,
        }
    }
}

#[cfg(unix)]
#[test]
fn green_relay_recolors_output_and_restores_the_terminal() {
    let sb = sandbox();
    install_script(
        &sb.bin_dir,
        "codex",
        "#!/bin/sh\nstty size\nprintf 'A\\033[0mB\\033[1mC'\nexit 5\n",
    );
    let mut command = sb.terminal_cos();
    command
        .env("PATH", format!("{}:/usr/bin:/bin", sb.bin_dir.display()))
        .args(["chat", "--codex-backend", "local"]);

    let run = terminal::run(command, 30, 100);

    assert_eq!(run.status.code(), Some(5), "stderr: {}", run.stderr);
    let setup = contains_bytes(&run.output, b"\x1b]10;#00ff00\x07").expect("palette set up");
    let relayed =
        contains_bytes(&run.output, b"A\x1b[0m\x1b[32mB\x1b[1mC").expect("output recolored");
    let reset = contains_bytes(&run.output, b"\x1b]110\x07").expect("palette reset");
    assert!(setup < relayed && relayed < reset);
    assert!(contains_bytes(&run.output, b"30 100").is_some());
    assert_eq!(run.mode_before, run.mode_after);
}

#[cfg(unix)]
#[test]
fn green_relay_leaves_terminal_untouched_when_agent_cannot_start() {
    let sb = sandbox();
    install_script(&sb.bin_dir, "codex", "#!/nonexistent/interpreter\n");

    let mut command = sb.terminal_cos();
    command.args(["chat", "--codex-backend", "local"]);
    let run = terminal::run(command, 24, 80);

    assert_eq!(run.status.code(), Some(1));
    assert!(run.stderr.contains("Failed to start 'codex'"), "{}", run.stderr);
    assert_eq!(run.mode_before, run.mode_after);
}

#[cfg(unix)]
#[test]
fn docker_resume_restores_session_home_and_sends_prompt_verbatim() {
    let sb = sandbox();
    install_fake_docker(&sb.bin_dir);
    let args_file = sb.repo.join("args.bin");

    let mut command = sb.terminal_cos();
    command
        .env("COS_TEST_ARGS_FILE", &args_file)
        .env(
            "COS_TEST_SESSION_LOG",
            "/home/app/codex-home/workspace/u1/.codex/sessions/2025/01/02/rollout-sess-1.jsonl",
        )
        .args(["resume", "sess-1", "continue", "--terminal-theme", "default"]);
    let run = terminal::run(command, 24, 80);

    assert_eq!(run.status.code(), Some(4), "stderr: {}", run.stderr);
    assert_eq!(
        recorded_args(&args_file),
        [
            "exec",
            "-i",
            "-t",
            "-e",
            "HOME=/home/app/codex-home/workspace/u1",
            "-w",
            "/app",
            "task-app",
            "codex",
            "resume",
            "--cd",
            "/app",
            "--sandbox",
            "workspace-write",
            "--ask-for-approval",
            "on-request",
            "sess-1",
            "-c",
            "mcp_servers.task-management-tools.url=\"http://mcp-tools:8090/mcp\"",
            "-c",
            "mcp_servers.task-management-tools.enabled=true",
            "continue",
        ]
    );
}
