use std::{
    io::{BufRead, BufReader},
    path::Path,
    process::{Child, Command, Stdio},
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;

const STOP_GRACE: Duration = Duration::from_secs(2);
const STOP_POLL: Duration = Duration::from_millis(50);

static FAILURE_KEYWORDS: [&str; 7] = [
    "error", "failed", "invalid", "cannot", "required", "panic", "fatal",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        return match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        return match self {
            Severity::Info => "info",
            Severity::Error => "error",
        };
    }
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub severity: Severity,
    pub message: String,
}

/// A line mentioning any failure keyword is reported as an error, everything
/// else as info. The match is case-insensitive.
pub fn classify_line(line: &str) -> Severity {
    let lower = line.to_lowercase();
    for keyword in FAILURE_KEYWORDS.iter() {
        if lower.contains(keyword) {
            return Severity::Error;
        }
    }
    return Severity::Info;
}

/// Supervises at most one paqet process at a time. Output lines are
/// classified and forwarded over the channel handed to `new`, in arrival
/// order.
pub struct Paqet {
    state: Arc<Mutex<State>>,
    process: Mutex<Option<Child>>,
    sink: mpsc::Sender<LogLine>,
    elevate: bool,
}

#[cfg(unix)]
fn default_elevate() -> bool {
    return unsafe { libc::geteuid() } != 0;
}

#[cfg(not(unix))]
fn default_elevate() -> bool {
    return false;
}

impl Paqet {
    pub fn new(sink: mpsc::Sender<LogLine>) -> Paqet {
        return Paqet {
            state: Arc::new(Mutex::new(State::Stopped)),
            process: Mutex::new(None),
            sink: sink,
            elevate: default_elevate(),
        };
    }

    pub fn elevate(mut self, elevate: bool) -> Paqet {
        self.elevate = elevate;
        return self;
    }

    pub fn state(&self) -> State {
        return *self.state.lock();
    }

    /// Launches `<binary> run -c <config>`. Returns false without touching
    /// anything when a session is already underway or the spawn fails.
    pub fn start(&self, binary: &Path, config: &Path) -> bool {
        {
            let mut state = self.state.lock();
            if *state != State::Stopped {
                logging!("Paqet", "Cannot start: session is {}.", state.as_str());
                return false;
            }
            *state = State::Starting;
        }

        // Holding the handle slot across spawn-and-store serializes this
        // with stop; a stop that won the slot first has already cleared the
        // state, in which case nothing may be spawned.
        let mut process = self.process.lock();
        if *self.state.lock() != State::Starting {
            return false;
        }

        // A previous session that exited on its own still holds its handle.
        if let Some(mut old) = process.take() {
            let _ = old.wait();
        }

        let mut command = if self.elevate {
            let mut command = Command::new("sudo");
            command.arg(binary);
            command
        } else {
            Command::new(binary)
        };
        command
            .arg("run")
            .arg("-c")
            .arg(config)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_family = "windows")]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(0x08000000);
        }

        logging!("Paqet", "Starting paqet: {:?}", command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                logging!("Paqet", "Cannot spawn paqet: {:?}", e);
                let _ = self.sink.send(LogLine {
                    severity: Severity::Error,
                    message: format!("Process error: {}", e),
                });
                *self.state.lock() = State::Stopped;
                return false;
            }
        };

        self.pump_std(child.stdout.take().unwrap(), true);
        self.pump_std(child.stderr.take().unwrap(), false);

        *process = Some(child);
        drop(process);
        {
            // The child may already have exited and cleared the state.
            let mut state = self.state.lock();
            if *state == State::Starting {
                *state = State::Running;
            }
        }
        return true;
    }

    fn pump_std<R: std::io::Read + Send + 'static>(&self, source: R, primary: bool) {
        let sink = self.sink.clone();
        let state = self.state.clone();
        thread::spawn(move || {
            let reader = BufReader::new(source);
            for line in reader.lines() {
                let Ok(line) = line else {
                    break;
                };
                if matches!(*state.lock(), State::Stopping) {
                    break;
                }
                let _ = sink.send(LogLine {
                    severity: classify_line(&line),
                    message: line,
                });
            }

            // Natural stream end. The process is gone; only the state is
            // cleared, nothing gets signalled.
            if primary {
                let mut state = state.lock();
                if matches!(*state, State::Starting | State::Running) {
                    *state = State::Stopped;
                }
            }
        });
    }

    /// Graceful termination, then a kill once the grace period runs out.
    /// Calling it with nothing running is a no-op.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == State::Stopped {
                return;
            }
            *state = State::Stopping;
        }

        if let Some(mut child) = self.process.lock().take() {
            logging!("Paqet", "Stopping paqet, pid={}.", child.id());
            Self::terminate(&child);

            let deadline = Instant::now() + STOP_GRACE;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() >= deadline => {
                        logging!("Paqet", "Grace period expired, killing paqet.");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Ok(None) => thread::sleep(STOP_POLL),
                    Err(_) => break,
                }
            }
        }

        *self.state.lock() = State::Stopped;
    }

    #[cfg(unix)]
    fn terminate(child: &Child) {
        unsafe {
            libc::kill(child.id() as i32, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn terminate(child: &Child) {
        // No SIGTERM equivalent; the grace loop reaps the kill below.
        let _ = child;
    }
}

impl Drop for Paqet {
    fn drop(&mut self) {
        if let Some(mut child) = self.process.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
