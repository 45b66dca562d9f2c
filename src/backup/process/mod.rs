//! External process execution with non-blocking output draining.

pub mod registry;

use crate::backup::cancel::CancellationToken;
use crate::backup::process::registry::{ProcessRegistry, RegistryGuard};
use crate::backup::result_error::result::Result;
use derive_more::Display;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long to keep reading a closed child's pipes held open by its own children.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// tar and rsync use this for "some files vanished/changed", which is not a failure.
pub const WARNING_EXIT_CODE: i32 = 2;

/// A command to launch.
#[derive(Clone, Debug)]
pub enum CommandLine {
    /// Argument vector, no shell interpolation
    Argv { program: OsString, args: Vec<OsString> },
    /// A user-supplied command line run through the platform shell
    Shell(String),
}

impl CommandLine {
    pub fn argv<P: AsRef<OsStr>>(program: P) -> Self {
        CommandLine::Argv {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
        }
    }

    pub fn arg<A: AsRef<OsStr>>(mut self, arg: A) -> Self {
        if let CommandLine::Argv { args, .. } = &mut self {
            args.push(arg.as_ref().to_os_string());
        }
        self
    }

    pub fn args<I: IntoIterator<Item = A>, A: AsRef<OsStr>>(self, args: I) -> Self {
        args.into_iter().fold(self, |cmd, arg| cmd.arg(arg))
    }

    /// Runs the command as `nice -n <level> ...` when a `nice` binary is available.
    pub fn with_nice(self, nice: Option<&Path>, level: i32) -> Self {
        match (self, nice) {
            (CommandLine::Argv { program, args }, Some(nice)) => {
                let mut wrapped = vec![
                    OsString::from("-n"),
                    OsString::from(level.to_string()),
                    program,
                ];
                wrapped.extend(args);
                CommandLine::Argv {
                    program: nice.as_os_str().to_os_string(),
                    args: wrapped,
                }
            }
            (cmd, _) => cmd,
        }
    }

    /// Loggable description. Shell commands may carry secrets and are never spelled out.
    pub fn describe(&self) -> String {
        match self {
            CommandLine::Argv { program, args } => std::iter::once(program)
                .chain(args.iter())
                .map(|s| s.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" "),
            CommandLine::Shell(_) => "user command".to_string(),
        }
    }

    fn to_command(&self) -> Command {
        match self {
            CommandLine::Argv { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            #[cfg(unix)]
            CommandLine::Shell(line) => {
                let mut command = Command::new("/bin/sh");
                command.arg("-c").arg(line);
                command
            }
            #[cfg(not(unix))]
            CommandLine::Shell(line) => {
                let mut command = Command::new("cmd");
                command.arg("/C").arg(line);
                command
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Exit code 2 of tar/rsync
    Warning,
    Failure,
}

/// The outcome of a finished child process.
#[derive(Debug)]
pub struct ProcessExit {
    pub pid: u32,
    /// `None` when terminated by a signal
    pub code: Option<i32>,
    /// Empty when stdout went to a sink file
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Classification for archive/mirror tools, where 2 is a non-fatal warning.
    pub fn classify(&self) -> ExitClass {
        match self.code {
            Some(0) => ExitClass::Success,
            Some(WARNING_EXIT_CODE) => ExitClass::Warning,
            _ => ExitClass::Failure,
        }
    }
}

/// A live child process. Registered as live until waited on or dropped.
pub struct ProcessHandle {
    pid: u32,
    child: Arc<Mutex<Child>>,
    stderr: Receiver<Vec<u8>>,
    stdout: Option<Receiver<Vec<u8>>>,
    _guard: RegistryGuard,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Polls the child every [`POLL_INTERVAL`], accumulating output chunks as they
    /// arrive, until it exits.
    ///
    /// Pipes still held open by a backgrounded grandchild are read for at most
    /// [`PIPE_DRAIN_TIMEOUT`] of silence after the exit, never until they close.
    pub fn wait_draining(self) -> Result<ProcessExit> {
        let mut stderr = Vec::new();
        let mut stdout = Vec::new();
        let status = loop {
            drain_available(&self.stderr, &mut stderr);
            if let Some(receiver) = &self.stdout {
                drain_available(receiver, &mut stdout);
            }
            let status = self
                .child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait()?;
            match status {
                Some(status) => break status,
                None => std::thread::sleep(POLL_INTERVAL),
            }
        };

        drain_until_quiet(&self.stderr, &mut stderr);
        if let Some(receiver) = &self.stdout {
            drain_until_quiet(receiver, &mut stdout);
        }

        Ok(ProcessExit {
            pid: self.pid,
            code: status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

fn drain_available(receiver: &Receiver<Vec<u8>>, buffer: &mut Vec<u8>) {
    loop {
        match receiver.try_recv() {
            Ok(chunk) => buffer.extend(chunk),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
        }
    }
}

fn drain_until_quiet(receiver: &Receiver<Vec<u8>>, buffer: &mut Vec<u8>) {
    loop {
        match receiver.recv_timeout(PIPE_DRAIN_TIMEOUT) {
            Ok(chunk) => buffer.extend(chunk),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (sender, receiver) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sender.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    receiver
}

/// Launches external commands and tracks them as live until they exit.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    search_path: Option<OsString>,
    registry: Arc<ProcessRegistry>,
    cancel: CancellationToken,
}

impl ProcessRunner {
    pub fn new(
        search_path: Option<OsString>,
        registry: Arc<ProcessRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            search_path,
            registry,
            cancel,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Starts `command` with stderr piped. Stdout goes to `stdout_sink` when given,
    /// otherwise it is captured.
    pub fn spawn(&self, command: &CommandLine, stdout_sink: Option<File>) -> Result<ProcessHandle> {
        self.cancel.checkpoint()?;

        let mut cmd = command.to_command();
        cmd.stdin(Stdio::null()).stderr(Stdio::piped());
        match stdout_sink {
            Some(file) => cmd.stdout(Stdio::from(file)),
            None => cmd.stdout(Stdio::piped()),
        };
        if let Some(path) = &self.search_path {
            cmd.env("PATH", path);
        }

        tracing::debug!("Spawning {}", command.describe());
        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stderr = child.stderr.take().map(spawn_pipe_reader);
        let stdout = child.stdout.take().map(spawn_pipe_reader);
        let stderr = stderr.unwrap_or_else(|| mpsc::channel().1);

        let child = Arc::new(Mutex::new(child));
        let guard = self.registry.register(pid, child.clone());
        // a cancel that raced the spawn must still reach this child
        if self.cancel.is_cancelled() {
            self.registry.kill_all();
        }

        Ok(ProcessHandle {
            pid,
            child,
            stderr,
            stdout,
            _guard: guard,
        })
    }

    /// Spawns `command` and blocks until it exits.
    pub fn run(&self, command: &CommandLine, stdout_sink: Option<File>) -> Result<ProcessExit> {
        self.spawn(command, stdout_sink)?.wait_draining()
    }
}
