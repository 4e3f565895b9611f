use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::json;

use crate::config::ListenerControlConfig;
use crate::logging::{LogLevel, Logger};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const RELAY_SETTLE_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum SupervisorError {
    MissingProgram,
    Spawn { program: String, source: io::Error },
    CaptureStream { stream: OutputStream },
    RelaySpawn(io::Error),
    Wait(io::Error),
    Signal { pid: u32, source: Errno },
    InvalidTransition { from: &'static str, event: &'static str },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingProgram => write!(f, "host.listener_control.program is not configured"),
            Self::Spawn { program, source } => {
                write!(f, "failed to spawn listener-control program '{program}': {source}")
            }
            Self::CaptureStream { stream } => {
                write!(f, "failed to capture listener-control {stream}")
            }
            Self::RelaySpawn(source) => write!(f, "failed to start output relay thread: {source}"),
            Self::Wait(source) => write!(f, "failed to poll listener-control status: {source}"),
            Self::Signal { pid, source } => {
                write!(f, "failed to signal listener-control process {pid}: {source}")
            }
            Self::InvalidTransition { from, event } => {
                write!(f, "supervisor cannot handle {event} while {from}")
            }
        }
    }
}

impl std::error::Error for SupervisorError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    Spawned { pid: u32 },
    Output { stream: OutputStream, chunk: String },
    TerminateRequested,
    Exited { code: Option<i32> },
}

impl SupervisorEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Spawned { .. } => "spawned",
            Self::Output { .. } => "output",
            Self::TerminateRequested => "terminate-requested",
            Self::Exited { .. } => "exited",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Spawning,
    Running { pid: u32 },
    Terminating { pid: u32 },
    Exited { code: Option<i32> },
}

impl SupervisorState {
    fn name(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Running { .. } => "running",
            Self::Terminating { .. } => "terminating",
            Self::Exited { .. } => "exited",
        }
    }

    /// Pure transition function; output never changes the state.
    pub fn apply(self, event: &SupervisorEvent) -> Result<Self, SupervisorError> {
        let next = match (self, event) {
            (Self::Spawning, SupervisorEvent::Spawned { pid }) => Self::Running { pid: *pid },
            (_, SupervisorEvent::Output { .. }) if self != Self::Spawning => self,
            (Self::Running { pid }, SupervisorEvent::TerminateRequested)
            | (Self::Terminating { pid }, SupervisorEvent::TerminateRequested) => {
                Self::Terminating { pid }
            }
            (Self::Spawning, SupervisorEvent::Exited { code })
            | (Self::Running { .. }, SupervisorEvent::Exited { code })
            | (Self::Terminating { .. }, SupervisorEvent::Exited { code }) => {
                Self::Exited { code: *code }
            }
            _ => {
                return Err(SupervisorError::InvalidTransition {
                    from: self.name(),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

/// Owns the listener-control subprocess for the lifetime of the instance.
pub struct ListenerSupervisor {
    child: Child,
    state: SupervisorState,
    events: Receiver<SupervisorEvent>,
    relays: Vec<JoinHandle<()>>,
    logger: Logger,
}

impl ListenerSupervisor {
    /// Spawns the configured program with the session id appended as its last argument.
    pub fn spawn(
        config: &ListenerControlConfig,
        session_id: &str,
        logger: Logger,
    ) -> Result<Self, SupervisorError> {
        let program = config
            .program
            .as_deref()
            .filter(|program| !program.trim().is_empty())
            .ok_or(SupervisorError::MissingProgram)?;

        let mut child = Command::new(program)
            .args(&config.args)
            .arg(session_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.to_owned(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(SupervisorError::CaptureStream {
            stream: OutputStream::Stdout,
        });
        let stderr = child.stderr.take().ok_or(SupervisorError::CaptureStream {
            stream: OutputStream::Stderr,
        });
        let (stdout, stderr) = match (stdout, stderr) {
            (Ok(stdout), Ok(stderr)) => (stdout, stderr),
            (Err(error), _) | (_, Err(error)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(error);
            }
        };

        let (sender, events) = mpsc::channel();
        let relays = match spawn_relays(stdout, stderr, &sender) {
            Ok(relays) => relays,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(error);
            }
        };

        let pid = child.id();
        let mut supervisor = Self {
            child,
            state: SupervisorState::Spawning,
            events,
            relays,
            logger,
        };
        supervisor.transition(SupervisorEvent::Spawned { pid })?;
        supervisor.logger.log(
            LogLevel::Info,
            Some("supervisor::spawn"),
            "Listener-control subprocess started",
            Some(json!({"program": program, "pid": pid})),
        );
        Ok(supervisor)
    }

    #[cfg(test)]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Relays buffered output and reports the exit code once the child has gone.
    /// Never waits on the relay threads: descendants of the child may still hold its pipes.
    pub fn poll(&mut self) -> Result<Option<Option<i32>>, SupervisorError> {
        self.drain_output();
        if let SupervisorState::Exited { code } = self.state {
            return Ok(Some(code));
        }

        match self.child.try_wait().map_err(SupervisorError::Wait)? {
            Some(status) => {
                self.settle_relays();
                self.drain_output();
                let code = status.code();
                self.transition(SupervisorEvent::Exited { code })?;
                self.logger.log(
                    LogLevel::Warn,
                    Some("supervisor::exit"),
                    "Listener-control subprocess exited",
                    Some(json!({"pid": self.child.id(), "code": code})),
                );
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Sends SIGINT; repeated calls re-send the signal.
    pub fn request_terminate(&mut self) -> Result<(), SupervisorError> {
        if matches!(self.state, SupervisorState::Exited { .. }) {
            return Ok(());
        }
        self.transition(SupervisorEvent::TerminateRequested)?;

        let pid = self.child.id();
        match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::Signal { pid, source }),
        }
    }

    pub fn wait_for_exit(&mut self, timeout: Duration) -> Result<Option<Option<i32>>, SupervisorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll()? {
                return Ok(Some(code));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn transition(&mut self, event: SupervisorEvent) -> Result<(), SupervisorError> {
        self.state = self.state.apply(&event)?;
        Ok(())
    }

    fn drain_output(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let SupervisorEvent::Output { stream, chunk } = &event {
                let level = match stream {
                    OutputStream::Stdout => LogLevel::Info,
                    OutputStream::Stderr => LogLevel::Warn,
                };
                let context = format!("listener::{stream}");
                self.logger.log(level, Some(context.as_str()), chunk, None);
            }
            if let Ok(next) = self.state.apply(&event) {
                self.state = next;
            }
        }
    }

    /// Gives the relays a short window to reach end of stream after the child exits.
    fn settle_relays(&self) {
        let deadline = Instant::now() + RELAY_SETTLE_WINDOW;
        while Instant::now() < deadline && !self.relays.iter().all(JoinHandle::is_finished) {
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Joins relays that reached end of stream; the rest are detached.
    fn release_relays(&mut self) {
        for relay in self.relays.drain(..) {
            if relay.is_finished() {
                let _ = relay.join();
            }
        }
    }
}

impl Drop for ListenerSupervisor {
    fn drop(&mut self) {
        if !matches!(self.state, SupervisorState::Exited { .. }) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        self.release_relays();
    }
}

fn spawn_relays(
    stdout: impl Read + Send + 'static,
    stderr: impl Read + Send + 'static,
    sender: &Sender<SupervisorEvent>,
) -> Result<Vec<JoinHandle<()>>, SupervisorError> {
    let stdout_relay = spawn_relay(OutputStream::Stdout, stdout, sender.clone())?;
    let stderr_relay = spawn_relay(OutputStream::Stderr, stderr, sender.clone())?;
    Ok(vec![stdout_relay, stderr_relay])
}

fn spawn_relay(
    stream: OutputStream,
    source: impl Read + Send + 'static,
    sender: Sender<SupervisorEvent>,
) -> Result<JoinHandle<()>, SupervisorError> {
    thread::Builder::new()
        .name(format!("listener-{stream}"))
        .spawn(move || {
            let mut reader = BufReader::new(source);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let chunk = trim_line_endings(&String::from_utf8_lossy(&line)).to_owned();
                        if chunk.is_empty() {
                            continue;
                        }
                        if sender.send(SupervisorEvent::Output { stream, chunk }).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .map_err(SupervisorError::RelaySpawn)
}

pub fn trim_line_endings(chunk: &str) -> &str {
    chunk.trim_matches(|c| c == '\r' || c == '\n')
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::config::ListenerControlConfig;
    use crate::logging::tests::capturing_logger;

    use super::{
        trim_line_endings, ListenerSupervisor, OutputStream, SupervisorError, SupervisorEvent,
        SupervisorState,
    };

    fn shell(script: &str) -> ListenerControlConfig {
        ListenerControlConfig {
            program: Some("/bin/sh".to_owned()),
            args: vec!["-c".to_owned(), script.to_owned(), "listener".to_owned()],
        }
    }

    #[test]
    fn state_machine_follows_lifecycle() {
        let state = SupervisorState::Spawning
            .apply(&SupervisorEvent::Spawned { pid: 7 })
            .expect("spawned");
        assert_eq!(state, SupervisorState::Running { pid: 7 });

        let state = state
            .apply(&SupervisorEvent::Output {
                stream: OutputStream::Stdout,
                chunk: "ready".to_owned(),
            })
            .expect("output keeps state");
        assert_eq!(state, SupervisorState::Running { pid: 7 });

        let state = state
            .apply(&SupervisorEvent::TerminateRequested)
            .expect("terminate");
        assert_eq!(state, SupervisorState::Terminating { pid: 7 });

        let state = state
            .apply(&SupervisorEvent::Exited { code: Some(0) })
            .expect("exited");
        assert_eq!(state, SupervisorState::Exited { code: Some(0) });
    }

    #[test]
    fn state_machine_rejects_out_of_order_events() {
        assert!(matches!(
            SupervisorState::Spawning.apply(&SupervisorEvent::TerminateRequested),
            Err(SupervisorError::InvalidTransition { from: "spawning", .. })
        ));
        assert!(matches!(
            SupervisorState::Exited { code: None }.apply(&SupervisorEvent::Spawned { pid: 1 }),
            Err(SupervisorError::InvalidTransition { from: "exited", event: "spawned" })
        ));
        assert!(SupervisorState::Running { pid: 1 }
            .apply(&SupervisorEvent::Spawned { pid: 2 })
            .is_err());
    }

    #[test]
    fn trims_only_leading_and_trailing_line_endings() {
        assert_eq!(trim_line_endings("\r\nhello world\r\n"), "hello world");
        assert_eq!(trim_line_endings("a\nb\n"), "a\nb");
        assert_eq!(trim_line_endings("  spaced  \n"), "  spaced  ");
    }

    #[test]
    fn missing_program_is_rejected() {
        let (logger, _) = capturing_logger();
        assert!(matches!(
            ListenerSupervisor::spawn(&ListenerControlConfig::default(), "sid", logger),
            Err(SupervisorError::MissingProgram)
        ));
    }

    #[test]
    fn relays_output_and_passes_session_id_last() {
        let (logger, sink) = capturing_logger();
        let mut supervisor = ListenerSupervisor::spawn(
            &shell("echo \"session=$1\"; echo oops 1>&2"),
            "sess1234",
            logger,
        )
        .expect("spawn should work");

        let code = supervisor
            .wait_for_exit(Duration::from_secs(5))
            .expect("poll should work");
        assert_eq!(code, Some(Some(0)));
        assert_eq!(supervisor.state(), SupervisorState::Exited { code: Some(0) });

        let lines = sink.lines();
        assert!(lines
            .iter()
            .any(|line| line.contains("[listener::stdout] session=sess1234")));
        assert!(lines.iter().any(|line| line.contains("[listener::stderr] oops")));
        assert!(lines.iter().any(|line| line.contains("Listener-control subprocess exited")));
    }

    #[test]
    fn sigint_moves_running_child_through_terminating_to_exited() {
        let (logger, _) = capturing_logger();
        let mut supervisor =
            ListenerSupervisor::spawn(&shell("trap 'exit 3' INT; while :; do sleep 0.05; done"), "s", logger)
                .expect("spawn should work");
        assert!(matches!(supervisor.state(), SupervisorState::Running { .. }));
        assert_eq!(supervisor.poll().expect("poll"), None);

        // Give the shell time to install its trap.
        std::thread::sleep(Duration::from_millis(200));
        supervisor.request_terminate().expect("signal should send");
        assert!(matches!(supervisor.state(), SupervisorState::Terminating { .. }));

        let code = supervisor
            .wait_for_exit(Duration::from_secs(5))
            .expect("poll should work");
        assert_eq!(code, Some(Some(3)));
        supervisor.request_terminate().expect("terminating an exited child is a no-op");
    }

    #[test]
    fn exit_is_reported_while_a_background_descendant_keeps_the_pipes_open() {
        let (logger, sink) = capturing_logger();
        let started = Instant::now();
        let mut supervisor = ListenerSupervisor::spawn(&shell("sleep 4 & echo parent-done"), "s", logger)
            .expect("spawn should work");

        let code = supervisor
            .wait_for_exit(Duration::from_millis(3000))
            .expect("poll should work");
        assert_eq!(code, Some(Some(0)));
        drop(supervisor);

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(sink
            .lines()
            .iter()
            .any(|line| line.contains("[listener::stdout] parent-done")));
    }

    #[test]
    fn unknown_program_fails_to_spawn() {
        let (logger, _) = capturing_logger();
        let config = ListenerControlConfig {
            program: Some("/nonexistent/relayhub-listener".to_owned()),
            args: Vec::new(),
        };
        assert!(matches!(
            ListenerSupervisor::spawn(&config, "s", logger),
            Err(SupervisorError::Spawn { .. })
        ));
    }
}
