//! Runs the built agent command, directly or behind a pseudo-terminal that keeps the
//! green palette in place while the agent redraws.

use crate::command::CommandSpec;
use crate::config::TerminalTheme;
use crate::error::CosError;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use std::collections::BTreeMap;
use std::env;
use std::io;
use std::process::{Command, ExitStatus};
use tracing::debug;

/// Palette overrides for OSC-capable terminals: default foreground plus the green,
/// white and bright slots, then a green SGR for the current pen.
pub const GREEN_THEME_SETUP: &[u8] = b"\x1b]10;#00ff00\x07\x1b]4;2;#00ff00\x07\x1b]4;10;#00ff00\x07\x1b]4;7;#00ff00\x07\x1b]4;15;#00ff00\x07\x1b[0;32m";
pub const GREEN_THEME_RESET: &[u8] =
    b"\x1b[0m\x1b]110\x07\x1b]104;2\x07\x1b]104;10\x07\x1b]104;7\x07\x1b]104;15\x07";

const GREEN_FOREGROUND: &[u8] = b"\x1b[32m";
const FOREGROUND_RESET_PARAMS: [&[u8]; 4] = [b"0", b"39", b"37", b"97"];
const MAX_PENDING_SGR: usize = 64;

static SGR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[([0-9;]*)m").expect("valid SGR pattern"));

fn resets_foreground(params: &[u8]) -> bool {
    let parts: Vec<&[u8]> = params
        .split(|byte| *byte == b';')
        .filter(|part| !part.is_empty())
        .collect();
    parts.is_empty() || parts.iter().any(|part| FOREGROUND_RESET_PARAMS.contains(part))
}

/// Follows every SGR that would fall back to the terminal's own foreground with green.
pub fn apply_green_theme(chunk: &[u8]) -> Vec<u8> {
    SGR_PATTERN
        .replace_all(chunk, |caps: &Captures<'_>| {
            let mut sequence = caps[0].to_vec();
            if resets_foreground(&caps[1]) {
                sequence.extend_from_slice(GREEN_FOREGROUND);
            }
            sequence
        })
        .into_owned()
}

/// Streaming form of [`apply_green_theme`] that holds back an unfinished
/// `ESC [ params` tail so sequences split across reads are still rewritten.
#[derive(Debug, Default)]
pub struct SgrRewriter {
    pending: Vec<u8>,
}

impl SgrRewriter {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(chunk);
        let cut = incomplete_sgr_start(&data).unwrap_or(data.len());
        self.pending = data.split_off(cut);
        apply_green_theme(&data)
    }

    /// Bytes still held back; they never form a complete sequence.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

fn incomplete_sgr_start(data: &[u8]) -> Option<usize> {
    let start = data.iter().rposition(|byte| *byte == 0x1b)?;
    let tail = &data[start..];
    if tail.len() > MAX_PENDING_SGR {
        return None;
    }
    let unfinished = match tail.get(1) {
        None => true,
        Some(b'[') => tail[2..]
            .iter()
            .all(|byte| byte.is_ascii_digit() || *byte == b';'),
        Some(_) => false,
    };
    unfinished.then_some(start)
}

fn apply_env_defaults(
    command: &mut Command,
    defaults: &BTreeMap<String, String>,
    is_set: impl Fn(&str) -> bool,
) {
    for (key, value) in defaults {
        if !is_set(key) {
            command.env(key, value);
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

fn spawn_error(program: &str, err: io::Error) -> CosError {
    CosError::Runtime(format!("Failed to start '{program}': {err}"))
}

fn run_direct(mut command: Command, program: &str) -> Result<i32, CosError> {
    let status = command.status().map_err(|err| spawn_error(program, err))?;
    Ok(exit_code(status))
}

/// Runs the agent to completion and returns its exit code.
pub fn run_agent(spec: &CommandSpec, theme: TerminalTheme) -> Result<i32, CosError> {
    let mut command = Command::new(spec.program());
    command.args(spec.args());
    apply_env_defaults(&mut command, spec.env_defaults(), |key| {
        env::var_os(key).is_some()
    });

    match theme {
        TerminalTheme::Default => run_direct(command, spec.program()),
        TerminalTheme::Green => run_themed(command, spec.program()),
    }
}

#[cfg(not(unix))]
fn run_themed(command: Command, program: &str) -> Result<i32, CosError> {
    run_direct(command, program)
}

#[cfg(unix)]
fn run_themed(command: Command, program: &str) -> Result<i32, CosError> {
    use std::io::IsTerminal;

    if !(io::stdin().is_terminal() && io::stdout().is_terminal()) {
        debug!("no interactive terminal; running agent without relay");
        return run_direct(command, program);
    }
    pty::run_relayed(command, program)
}

#[cfg(unix)]
mod pty {
    use super::{
        exit_code, spawn_error, SgrRewriter, GREEN_THEME_RESET, GREEN_THEME_SETUP,
    };
    use crate::error::CosError;
    use libc::{self, c_int};
    use signal_hook::low_level::pipe;
    use signal_hook::SigId;
    use std::io::{self, Read};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command, Stdio};
    use tracing::debug;

    const READ_CHUNK: usize = 65536;

    struct PtyPair {
        master: OwnedFd,
        slave: OwnedFd,
    }

    fn open_pty() -> io::Result<PtyPair> {
        let mut master: c_int = -1;
        let mut slave: c_int = -1;
        let result = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        let pair = unsafe {
            PtyPair {
                master: OwnedFd::from_raw_fd(master),
                slave: OwnedFd::from_raw_fd(slave),
            }
        };
        set_cloexec(pair.master.as_raw_fd())?;
        set_cloexec(pair.slave.as_raw_fd())?;
        Ok(pair)
    }

    fn set_cloexec(fd: RawFd) -> io::Result<()> {
        let result = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn copy_winsize(from: RawFd, to: RawFd) {
        let mut size = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            if libc::ioctl(from, libc::TIOCGWINSZ, &mut size) == 0 {
                libc::ioctl(to, libc::TIOCSWINSZ, &size);
            }
        }
    }

    fn get_termios(fd: RawFd) -> io::Result<libc::termios> {
        let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
        let result = unsafe { libc::tcgetattr(fd, &mut termios) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(termios)
    }

    fn set_termios(fd: RawFd, action: c_int, termios: &libc::termios) -> io::Result<()> {
        let result = unsafe { libc::tcsetattr(fd, action, termios) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read_fd(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            let result =
                unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
            if result >= 0 {
                return Ok(result as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn write_all_fd(fd: RawFd, bytes: &[u8]) -> io::Result<()> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let result = unsafe {
                libc::write(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if result == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            remaining = &remaining[result as usize..];
        }
        Ok(())
    }

    fn spawn_on_slave(command: &mut Command, slave: OwnedFd) -> io::Result<Child> {
        let stdout = slave.try_clone()?;
        let stderr = slave.try_clone()?;
        command
            .stdin(Stdio::from(slave))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // New session with the pty as controlling terminal, so ^C and resizes reach the agent.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        command.spawn()
    }

    fn watch(fd: RawFd) -> libc::pollfd {
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }
    }

    /// Self-pipe that turns readable whenever the real terminal is resized.
    struct ResizeWatch {
        hook: SigId,
        wake: UnixStream,
    }

    impl ResizeWatch {
        fn register() -> io::Result<Self> {
            let (wake, notify) = UnixStream::pair()?;
            wake.set_nonblocking(true)?;
            let hook = pipe::register(libc::SIGWINCH, notify)?;
            Ok(ResizeWatch { hook, wake })
        }

        fn fd(&self) -> RawFd {
            self.wake.as_raw_fd()
        }

        /// Empties the pipe before the resize is acted on; true when a signal arrived.
        fn drain(&self) -> bool {
            let mut buffer = [0u8; 64];
            let mut resized = false;
            loop {
                match (&self.wake).read(&mut buffer) {
                    Ok(0) => return resized,
                    Ok(_) => resized = true,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => return resized,
                }
            }
        }
    }

    impl Drop for ResizeWatch {
        fn drop(&mut self) {
            signal_hook::low_level::unregister(self.hook);
        }
    }

    /// Real terminal output. After the first failed write the rest is discarded so the
    /// pty keeps draining and the agent never blocks on a full buffer.
    struct OutputSink {
        fd: RawFd,
        failed: bool,
    }

    impl OutputSink {
        fn new(fd: RawFd) -> Self {
            OutputSink { fd, failed: false }
        }

        fn write(&mut self, bytes: &[u8]) {
            if self.failed || bytes.is_empty() {
                return;
            }
            if let Err(err) = write_all_fd(self.fd, bytes) {
                debug!(error = %err, "terminal output failed; discarding agent output");
                self.failed = true;
            }
        }
    }

    /// Owns everything the relay changes about the real terminal; dropping it puts
    /// the terminal back on every exit path.
    struct RelaySession {
        stdin_fd: RawFd,
        master: OwnedFd,
        original: libc::termios,
        output: OutputSink,
        resize: ResizeWatch,
    }

    impl RelaySession {
        fn start(master: OwnedFd) -> io::Result<Self> {
            let stdin_fd = libc::STDIN_FILENO;
            let original = get_termios(stdin_fd)?;
            let mut session = RelaySession {
                stdin_fd,
                master,
                original,
                output: OutputSink::new(libc::STDOUT_FILENO),
                resize: ResizeWatch::register()?,
            };

            session.output.write(GREEN_THEME_SETUP);
            let mut raw = session.original;
            unsafe {
                libc::cfmakeraw(&mut raw);
            }
            set_termios(session.stdin_fd, libc::TCSANOW, &raw)?;
            Ok(session)
        }

        fn pump(&mut self) -> io::Result<()> {
            let master_fd = self.master.as_raw_fd();
            let mut buffer = vec![0u8; READ_CHUNK];
            let mut rewriter = SgrRewriter::default();
            let mut stdin_open = true;
            let readable = libc::POLLIN | libc::POLLHUP | libc::POLLERR;

            loop {
                let mut fds = [
                    watch(if stdin_open { self.stdin_fd } else { -1 }),
                    watch(master_fd),
                    watch(self.resize.fd()),
                ];
                let result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
                if result < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }

                if fds[2].revents & readable != 0 && self.resize.drain() {
                    copy_winsize(self.stdin_fd, master_fd);
                }

                if fds[0].revents & readable != 0 {
                    match read_fd(self.stdin_fd, &mut buffer)? {
                        0 => stdin_open = false,
                        count => write_all_fd(master_fd, &buffer[..count])?,
                    }
                }

                if fds[1].revents & readable != 0 {
                    let count = match read_fd(master_fd, &mut buffer) {
                        Ok(count) => count,
                        // Linux reports a closed slave side as EIO.
                        Err(err) if err.raw_os_error() == Some(libc::EIO) => 0,
                        Err(err) => return Err(err),
                    };
                    if count == 0 {
                        break;
                    }
                    self.output.write(&rewriter.feed(&buffer[..count]));
                }
            }
            self.output.write(&rewriter.finish());
            Ok(())
        }
    }

    impl Drop for RelaySession {
        fn drop(&mut self) {
            let _ = set_termios(self.stdin_fd, libc::TCSADRAIN, &self.original);
            self.output.write(GREEN_THEME_RESET);
        }
    }

    fn reap(child: &mut Child) {
        let _ = child.kill();
        let _ = child.wait();
    }

    pub(super) fn run_relayed(mut command: Command, program: &str) -> Result<i32, CosError> {
        let pair = open_pty()?;
        copy_winsize(libc::STDIN_FILENO, pair.slave.as_raw_fd());

        let mut child = spawn_on_slave(&mut command, pair.slave).map_err(|err| spawn_error(program, err))?;
        // The parent's copies of the slave side live in `command`; the master only
        // reports end of output once they are closed.
        drop(command);
        debug!(pid = child.id(), "pty relay started");

        let mut session = match RelaySession::start(pair.master) {
            Ok(session) => session,
            Err(err) => {
                reap(&mut child);
                return Err(err.into());
            }
        };
        let outcome = session.pump().and_then(|()| child.wait());
        drop(session);

        match outcome {
            Ok(status) => {
                debug!(code = ?status.code(), "pty relay finished");
                Ok(exit_code(status))
            }
            Err(err) => {
                reap(&mut child);
                Err(err.into())
            }
        }
    }

}
