// Spawns the program under test for one invocation and captures its output
// under a hard time limit. The child is always reaped, including on
// timeout, early return and unwinding.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, warn};

use crate::case::CaseInput;
use crate::config::{InputChannel, ProgramConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_GRACE: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
    pub stdout_truncated: bool,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Owns the child process; dropping it kills and reaps a child that is
/// still running.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    fn kill_and_wait(&mut self) -> io::Result<ExitStatus> {
        kill_group(self.child.id());
        // kill() fails if the child already exited; wait() still reaps it.
        let _ = self.child.kill();
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            kill_group(self.child.id());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// The child leads its own process group, so this also reaches anything
/// the shell started.
#[cfg(unix)]
fn kill_group(pid: u32) {
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    // A non-zero status only means the group is already gone.
    if let Err(e) = status {
        warn!(pid, error = %e, "could not run kill, descendants may outlive the case");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

pub fn build_command(program: &ProgramConfig, input: &CaseInput) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c");

    let args: Option<Vec<String>> = match (program.input_channel, input) {
        (_, CaseInput::Args(args)) => Some(args.clone()),
        (InputChannel::Args, CaseInput::Text(text)) => {
            Some(text.split_whitespace().map(str::to_owned).collect())
        }
        (InputChannel::Stdin, CaseInput::Text(_)) => None,
    };

    match &args {
        Some(args) => {
            cmd.arg(format!("{} \"$@\"", program.command));
            cmd.arg("agentest");
            cmd.args(args);
            cmd.stdin(Stdio::null());
        }
        None => {
            cmd.arg(&program.command);
            cmd.stdin(Stdio::piped());
        }
    }

    if program.clear_env {
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
    }
    cmd.envs(&program.env);

    if let Some(dir) = &program.workdir {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd
}

/// Runs one invocation. `Err` means the program could not be started or
/// waited on; everything that happens after a successful spawn is reported
/// in `RawOutput`.
pub fn invoke(
    program: &ProgramConfig,
    input: &CaseInput,
    timeout: Duration,
    max_output_bytes: usize,
) -> io::Result<RawOutput> {
    let started = Instant::now();
    let deadline = started + timeout;

    let mut guard = ChildGuard::new(build_command(program, input).spawn()?);

    if let Some(mut stdin) = guard.child.stdin.take() {
        let data = match input {
            CaseInput::Text(text) => text.clone().into_bytes(),
            CaseInput::Args(_) => Vec::new(),
        };
        // A program that never reads stdin must not block the harness.
        thread::spawn(move || {
            let _ = stdin.write_all(&data);
        });
    }

    let stdout_rx = spawn_reader(guard.child.stdout.take(), max_output_bytes);
    let stderr_rx = spawn_reader(guard.child.stderr.take(), max_output_bytes);

    let mut timed_out = false;
    let status = loop {
        match guard.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    debug!(pid = guard.child.id(), "invocation timed out, killing");
                    timed_out = true;
                    break guard.kill_and_wait()?;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = guard.kill_and_wait();
                return Err(e);
            }
        }
    };

    // Descendants may still hold the pipes after the child itself exited.
    let drain_until = if timed_out {
        Instant::now() + DRAIN_GRACE
    } else {
        deadline.max(Instant::now() + DRAIN_GRACE)
    };
    let stdout = collect(&stdout_rx, drain_until);
    let stderr = collect(&stderr_rx, drain_until);
    if stdout.is_none() || stderr.is_none() {
        debug!(pid = guard.child.id(), "descendants still hold the pipes, killing group");
        kill_group(guard.child.id());
        timed_out = true;
    }

    let stdout = stdout.unwrap_or_default();
    let stderr = stderr.unwrap_or_default();

    Ok(RawOutput {
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        exit_code: status.code(),
        signal: exit_signal(&status),
        duration: started.elapsed(),
        timed_out,
        stdout_truncated: stdout.truncated,
    })
}

fn spawn_reader<R>(stream: Option<R>, limit: usize) -> Receiver<Captured>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(1);

    thread::spawn(move || {
        let mut captured = Captured::default();
        if let Some(mut stream) = stream {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let room = limit.saturating_sub(captured.bytes.len());
                        if n > room {
                            captured.truncated = true;
                        }
                        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        let _ = tx.send(captured);
    });

    rx
}

fn collect(rx: &Receiver<Captured>, until: Instant) -> Option<Captured> {
    let wait = until.saturating_duration_since(Instant::now());
    rx.recv_timeout(wait).ok()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn program(command: &str) -> ProgramConfig {
        ProgramConfig {
            command: command.to_string(),
            ..ProgramConfig::default()
        }
    }

    #[test]
    fn captures_stdout_stderr_and_code() {
        let out = invoke(
            &program("cat; echo oops >&2; exit 3"),
            &CaseInput::Text("hello\n".into()),
            Duration::from_secs(5),
            1024,
        )
        .unwrap();
        assert_eq!(out.stdout, b"hello\n");
        assert_eq!(out.stderr, b"oops\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
    }

    #[test]
    fn kills_on_timeout() {
        let started = Instant::now();
        let out = invoke(
            &program("echo partial; exec sleep 5"),
            &CaseInput::Text(String::new()),
            Duration::from_millis(200),
            1024,
        )
        .unwrap();
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_kills_background_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let cmd = format!("(sleep 1; touch {}) & sleep 5", marker.display());
        let out = invoke(
            &program(&cmd),
            &CaseInput::Text(String::new()),
            Duration::from_millis(200),
            1024,
        )
        .unwrap();
        assert!(out.timed_out);

        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn args_channel_passes_positional_arguments() {
        let mut p = program("printf '%s|'");
        p.input_channel = InputChannel::Args;
        let out = invoke(&p, &CaseInput::Text("a  b\tc".into()), Duration::from_secs(5), 1024).unwrap();
        assert_eq!(out.stdout, b"a|b|c|");
    }

    #[test]
    fn output_over_limit_is_truncated() {
        let out = invoke(
            &program("head -c 5000 /dev/zero"),
            &CaseInput::Text(String::new()),
            Duration::from_secs(5),
            100,
        )
        .unwrap();
        assert_eq!(out.stdout.len(), 100);
        assert!(out.stdout_truncated);
    }

    #[test]
    fn env_is_scoped_to_the_invocation() {
        let mut p = program("printf '%s' \"$AGENTEST_MARKER\"");
        p.env.insert("AGENTEST_MARKER".into(), "set".into());
        let out = invoke(&p, &CaseInput::Text(String::new()), Duration::from_secs(5), 64).unwrap();
        assert_eq!(out.stdout, b"set");
        assert!(std::env::var("AGENTEST_MARKER").is_err());
    }
}
