//! Engine process spawning and line-based I/O.
//!
//! Stdout and stderr are read line by line on background threads and
//! delivered, together with the exit status, through a tokio channel so the
//! provider can consume them from async code.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Empty shell prefix")]
    EmptyShellPrefix,

    #[error("Cannot quote argument: {0}")]
    Quote(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Failed to capture {0}")]
    Pipe(&'static str),

    #[error("Engine stdin is closed")]
    StdinClosed,

    #[error("Failed to write to engine stdin: {0}")]
    Write(#[from] std::io::Error),
}

/// Events emitted by an engine process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// The process exited. `None` when it was killed by a signal.
    Exit(Option<i32>),
}

#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Wrap the command in a shell, e.g. `/bin/zsh -l -c`, to pick up the
    /// user's PATH.
    pub shell_prefix: Option<String>,
}

impl SpawnConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            shell_prefix: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }

    /// Build the command: `<prefix> '<program> <args...>'` when a shell
    /// prefix is set, otherwise the program itself.
    pub fn command(&self) -> Result<Command, SpawnError> {
        let mut cmd = match self.shell_prefix.as_deref() {
            Some(prefix) => {
                let parts = shlex::split(prefix)
                    .filter(|p| !p.is_empty())
                    .ok_or(SpawnError::EmptyShellPrefix)?;

                let mut quoted = Vec::with_capacity(self.args.len() + 1);
                for part in std::iter::once(&self.program).chain(self.args.iter()) {
                    quoted.push(
                        shlex::try_quote(part)
                            .map_err(|_| SpawnError::Quote(part.clone()))?
                            .into_owned(),
                    );
                }

                let mut cmd = Command::new(&parts[0]);
                cmd.args(&parts[1..]).arg(quoted.join(" "));
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.program);
                cmd.args(&self.args);
                cmd
            }
        };

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

/// A running engine process.
pub struct EngineProcess {
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
}

impl EngineProcess {
    /// Spawn the process and start the reader and exit-watcher threads.
    pub fn spawn(config: &SpawnConfig) -> Result<Self, SpawnError> {
        let mut cmd = config.command()?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            program: config.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or(SpawnError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::Pipe("stderr"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let child = Arc::new(Mutex::new(Some(child)));
        let stdin = Arc::new(Mutex::new(stdin));

        let tx_stdout = tx.clone();
        let stdout_reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx_stdout.send(ProcessEvent::Stdout(line)).is_err() {
                    break;
                }
            }
        });

        let tx_stderr = tx.clone();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tx_stderr.send(ProcessEvent::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        let child_exit = Arc::clone(&child);
        let stdin_exit = Arc::clone(&stdin);
        thread::spawn(move || {
            let code = loop {
                {
                    let mut guard = child_exit.lock().unwrap();
                    match guard.as_mut().map(|c| c.try_wait()) {
                        Some(Ok(Some(status))) => {
                            guard.take();
                            break status.code();
                        }
                        Some(Ok(None)) => {}
                        Some(Err(_)) | None => {
                            guard.take();
                            break None;
                        }
                    }
                }
                thread::sleep(Duration::from_millis(100));
            };
            stdin_exit.lock().unwrap().take();
            // Deliver every stdout line before the exit.
            let _ = stdout_reader.join();
            let _ = tx.send(ProcessEvent::Exit(code));
        });

        Ok(Self {
            child,
            stdin,
            events: Some(rx),
        })
    }

    /// Write one line to stdin.
    pub fn write_line(&self, line: &str) -> Result<(), SpawnError> {
        let mut guard = self.stdin.lock().unwrap();
        let stdin = guard.as_mut().ok_or(SpawnError::StdinClosed)?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;
        Ok(())
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }

    pub fn is_running(&self) -> bool {
        self.child.lock().unwrap().is_some()
    }

    /// Stop the process gracefully (SIGINT on Unix, then force kill).
    pub fn stop(&self) {
        self.stdin.lock().unwrap().take();

        let mut guard = self.child.lock().unwrap();
        if let Some(child) = guard.as_mut() {
            #[cfg(unix)]
            {
                unsafe {
                    libc::kill(child.id() as i32, libc::SIGINT);
                }
                for _ in 0..30 {
                    thread::sleep(Duration::from_millis(100));
                    match child.try_wait() {
                        Ok(Some(_)) => {
                            guard.take();
                            return;
                        }
                        Ok(None) => continue,
                        Err(_) => break,
                    }
                }
            }

            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }

    pub fn kill(&self) {
        self.stdin.lock().unwrap().take();
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = SpawnConfig::new("engine", vec!["--json".to_string()])
            .working_dir("/tmp")
            .shell_prefix("/bin/bash -l -c");

        assert_eq!(config.program, "engine");
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.shell_prefix.as_deref(), Some("/bin/bash -l -c"));
    }

    #[test]
    fn shell_prefix_quotes_inner_command() {
        let config = SpawnConfig::new("my engine", vec!["a b".to_string(), "c".to_string()])
            .shell_prefix("/bin/sh -c");

        let cmd = config.command().unwrap();
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(cmd.get_program(), "/bin/sh");
        assert_eq!(args, vec!["-c", "'my engine' 'a b' c"]);
    }

    #[test]
    fn empty_shell_prefix_is_rejected() {
        let config = SpawnConfig::new("engine", vec![]).shell_prefix("   ");
        assert!(matches!(config.command(), Err(SpawnError::EmptyShellPrefix)));
    }

    #[test]
    fn direct_command_without_prefix() {
        let config = SpawnConfig::new("engine", vec!["--x".to_string()]);
        let cmd = config.command().unwrap();
        assert_eq!(cmd.get_program(), "engine");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn echoes_stdin_lines_then_exits() {
        let config = SpawnConfig::new("sh", vec!["-c".to_string(), "read line; echo \"got $line\"".to_string()]);
        let mut process = EngineProcess::spawn(&config).unwrap();
        let mut events = process.take_events().unwrap();

        process.write_line("hello").unwrap();

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, ProcessEvent::Exit(_));
            received.push(event);
            if done {
                break;
            }
        }

        assert_eq!(
            received,
            vec![
                ProcessEvent::Stdout("got hello".to_string()),
                ProcessEvent::Exit(Some(0))
            ]
        );
        assert!(!process.is_running());
        assert!(process.take_events().is_none());
    }
}
