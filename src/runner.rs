//! External processes behind a trait so probes can be scripted in tests.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

const DETAIL_LIMIT_CHARS: usize = 300;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Error stream if present, else output stream, capped for display.
    pub fn detail(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stdout = String::from_utf8_lossy(&self.stdout);
        let text = match stderr.trim() {
            "" => stdout.trim(),
            stderr => stderr,
        };
        if text.is_empty() {
            return "no output".to_string();
        }
        text.chars().take(DETAIL_LIMIT_CHARS).collect()
    }

    /// First line of whatever the program printed.
    pub fn first_line(&self) -> Option<String> {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        let text = match stdout.trim() {
            "" => stderr.trim().to_string(),
            stdout => stdout.to_string(),
        };
        text.lines().next().map(str::to_string)
    }
}

/// Seam for the short-lived probes run against the host and the container.
pub trait ProcessRunner {
    fn find_binary(&self, name: &str) -> Option<PathBuf>;

    /// Runs to completion with captured output; exceeding `timeout` is `ErrorKind::TimedOut`.
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> io::Result<CommandOutput>;
}

pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn find_binary(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn run(&self, program: &str, args: &[String], timeout: Duration) -> io::Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("`{program}` timed out after {}s", timeout.as_secs_f32()),
                ));
            }
            Err(err) => {
                let _ = child.kill();
                return Err(err);
            }
        };

        let status_code = status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: join_pipe_reader(stdout_reader),
            stderr: join_pipe_reader(stderr_reader),
        })
    }
}

type PipeReader = Option<thread::JoinHandle<Vec<u8>>>;

fn spawn_pipe_reader<R: Read + Send + 'static>(pipe: Option<R>) -> PipeReader {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_pipe_reader(reader: PipeReader) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::*;

    fn output(status_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            status_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn detail_prefers_stderr_and_caps_length() {
        assert_eq!(output(1, "out", "  err \n").detail(), "err");
        assert_eq!(output(1, " out ", "").detail(), "out");
        assert_eq!(output(7, "", "").detail(), "no output");
        let long = "x".repeat(500);
        assert_eq!(output(1, "", &long).detail().chars().count(), 300);
    }

    #[test]
    fn first_line_reads_version_banner() {
        assert_eq!(
            output(0, "codex-cli 0.40.0\nextra\n", "").first_line(),
            Some("codex-cli 0.40.0".to_string())
        );
        assert_eq!(output(0, "", "").first_line(), None);
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_output() {
        let args = vec!["-c".to_string(), "echo hello; echo oops >&2; exit 3".to_string()];
        let result = SystemRunner
            .run("sh", &args, Duration::from_secs(5))
            .unwrap();
        assert_eq!(result.status_code, 3);
        assert_eq!(result.stdout_text(), "hello");
        assert_eq!(result.detail(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_enforces_timeout() {
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let err = SystemRunner
            .run("sh", &args, Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
