//! Process supervisor.
//!
//! Every participant runs in its own OS process. The orchestrator re-executes a launcher
//! program (by default its own binary) with the hidden `participant` subcommand, writes a
//! [`ParticipantSpec`] to the child's stdin and drives it over that pipe from then on; the
//! child answers with its lifecycle state on stdout. See [`protocol`] for the line format.
//!
//! A participant that aborts, segfaults or is killed takes nothing else down. The supervisor
//! notices the exit and pushes a critical `ProcessExit` ERROR into the orchestrator's inbox,
//! exactly as if the participant had reported it.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Setup -> Running -> Cleanup -> Finished
//! ```
//!
//! While running, each loop iteration:
//! 1. leaves for cleanup if the exit flag is raised or an EXIT message arrived
//! 2. fires `on_start` / `on_stop` for new start or stop requests
//! 3. applies pending control commands
//! 4. polls the inbox and dispatches every message
//! 5. runs one `step`
//!
//! Errors and panics from any hook or handler are caught and sent to the orchestrator as
//! ERROR messages. They never end the loop; only exit does.

mod child;
pub mod protocol;

pub use child::{serve, Boot, ControlCommand};
pub use protocol::{Body, ParticipantSpec};

pub(crate) use child::run_participant;

use crate::error::{FleetError, FleetResult};
use crate::topology::Role;
use crate::transport::InboxSender;
use crate::wire::{ErrorReport, Message, Payload};
use parking_lot::Mutex;
use protocol::{Command, Report};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const CONTROL_QUEUE: usize = 16;
/// How long a killed participant gets to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Subcommand the launcher program runs a participant under.
pub const PARTICIPANT_COMMAND: &str = "participant";

/// A one-bit signal that can also be awaited.
#[derive(Debug, Default)]
pub struct Flag {
    raised: AtomicBool,
    notify: Notify,
}

impl Flag {
    /// Sets the flag and wakes every waiter.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Resets the flag.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    /// Whether the flag is set.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Clears the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    /// Resolves once the flag is raised.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

/// The requests the control pipe turns into flags inside a participant.
#[derive(Debug, Clone, Default)]
pub struct LifecycleFlags {
    /// Rising edge fires `on_start`
    pub start: Arc<Flag>,
    /// Rising edge fires `on_stop`
    pub stop: Arc<Flag>,
    /// Leave the loop
    pub exit: Arc<Flag>,
}

/// Where a participant is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Spawned, not yet set up
    Idle,
    /// Running `setup`
    Setup,
    /// In the main loop
    Running,
    /// Running `cleanup`
    Cleanup,
    /// Done; the process has exited or is about to
    Finished,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Setup => "setup",
            LifecycleState::Running => "running",
            LifecycleState::Cleanup => "cleanup",
            LifecycleState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<watch::Sender<LifecycleState>>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(watch::channel(LifecycleState::Idle).0))
    }
}

impl StateCell {
    pub(crate) fn set(&self, state: LifecycleState) {
        self.0.send_replace(state);
    }

    /// Current state.
    pub fn get(&self) -> LifecycleState {
        *self.0.borrow()
    }

    /// Receiver woken on every transition.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.0.subscribe()
    }
}

/// Program and arguments that start a participant process.
///
/// The program must hand its stdin and stdout to [`serve`], which is what the `daq_fleet`
/// binary does under its `participant` subcommand.
#[derive(Debug, Clone)]
pub struct ParticipantLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ParticipantLauncher {
    /// Runs `program participant`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![PARTICIPANT_COMMAND.into()],
        }
    }

    /// Re-executes the running binary.
    pub fn current_exe() -> FleetResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Replaces the arguments passed before the pipe takes over.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The program that is executed.
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

type Replies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>;

/// How a participant process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Exit {
    /// Reached Finished and exited successfully.
    Clean,
    /// Killed after the join timeout.
    Killed,
    /// Anything else, with the exit status.
    Crashed(String),
}

/// Orchestrator-side handle to one participant process.
pub struct WorkerHandle {
    name: String,
    role: Role,
    pid: Option<u32>,
    state: StateCell,
    finished: Arc<Flag>,
    commands: mpsc::Sender<Command>,
    replies: Replies,
    next_request: AtomicU64,
    kill: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<Exit>>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("pid", &self.pid)
            .field("state", &self.state.get())
            .finish()
    }
}

impl WorkerHandle {
    /// Participant name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker or saver.
    pub fn role(&self) -> Role {
        self.role
    }

    /// OS process id, while the process is known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last state the participant reported.
    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    fn command(&self, command: Command) {
        if let Err(e) = self.commands.try_send(command) {
            warn!(participant = %self.name, error = %e, "control command not delivered");
        }
    }

    /// Raises the participant's start flag.
    pub fn start(&self) {
        self.command(Command::Start);
    }

    /// Raises the participant's stop flag.
    pub fn stop(&self) {
        self.command(Command::Stop);
    }

    /// Asks the participant to leave its loop. Cooperative: takes effect at the next iteration.
    pub fn exit(&self) {
        self.command(Command::Exit);
    }

    /// Whether the process has exited, for whatever reason.
    pub fn is_finished(&self) -> bool {
        self.finished.is_raised()
    }

    /// Sends new parameters through the control pipe and waits for the reply.
    pub async fn update_params(
        &self,
        params: serde_json::Value,
        timeout: Duration,
    ) -> FleetResult<()> {
        let rejected = |reason: &str| FleetError::Control {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.is_finished() {
            return Err(rejected("participant is not running"));
        }
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.replies.lock().insert(id, reply);
        if self
            .commands
            .send(Command::UpdateParams { id, params })
            .await
            .is_err()
        {
            self.replies.lock().remove(&id);
            return Err(rejected("participant is not running"));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(rejected(&reason)),
            Ok(Err(_)) => Err(rejected("participant exited before replying")),
            Err(_) => {
                self.replies.lock().remove(&id);
                Err(rejected("no reply before timeout"))
            }
        }
    }

    /// Waits for the process to exit. Kills it if it is still running after `timeout`.
    pub async fn join(&mut self, timeout: Duration) -> FleetResult<()> {
        if tokio::time::timeout(timeout, self.finished.wait())
            .await
            .is_err()
        {
            if let Some(kill) = self.kill.take() {
                let _ = kill.send(());
            }
            if let Some(monitor) = self.monitor.take() {
                let _ = tokio::time::timeout(KILL_GRACE, monitor).await;
            }
            return Err(FleetError::JoinTimeout(self.name.clone()));
        }
        let Some(monitor) = self.monitor.take() else {
            return Ok(());
        };
        match monitor.await {
            Ok(Exit::Clean) => Ok(()),
            Ok(Exit::Killed) => Err(FleetError::JoinTimeout(self.name.clone())),
            Ok(Exit::Crashed(status)) => Err(FleetError::ParticipantCrashed {
                name: self.name.clone(),
                status,
            }),
            Err(e) => Err(FleetError::ParticipantCrashed {
                name: self.name.clone(),
                status: format!("monitor task failed: {e}"),
            }),
        }
    }
}

/// Starts one participant process from `spec`.
///
/// Crashes are reported as ERROR messages through `reports`.
pub fn spawn(
    spec: &ParticipantSpec,
    launcher: &ParticipantLauncher,
    reports: InboxSender,
) -> FleetResult<WorkerHandle> {
    let name = spec.name().to_string();
    let role = spec.wiring.role;
    let boot = protocol::encode(spec)?;

    let mut child = launcher
        .command()
        .spawn()
        .map_err(|source| FleetError::Spawn {
            name: name.clone(),
            source,
        })?;
    let pid = child.id();
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(FleetError::Protocol(format!("'{name}' started without pipes")));
    };

    let (commands, command_rx) = mpsc::channel(CONTROL_QUEUE);
    tokio::spawn(write_commands(name.clone(), stdin, boot, command_rx));

    let state = StateCell::default();
    let finished = Arc::new(Flag::default());
    let replies = Replies::default();
    let (kill, kill_rx) = oneshot::channel();
    let watch = Watch {
        name: name.clone(),
        pid,
        state: state.clone(),
        finished: finished.clone(),
        replies: replies.clone(),
        reports,
    };
    let monitor = tokio::spawn(monitor(watch, child, stdout, kill_rx));

    debug!(participant = %name, ?role, ?pid, program = %launcher.program.display(), "participant process spawned");
    Ok(WorkerHandle {
        name,
        role,
        pid,
        state,
        finished,
        commands,
        replies,
        next_request: AtomicU64::new(0),
        kill: Some(kill),
        monitor: Some(monitor),
    })
}

async fn write_commands(
    name: String,
    mut stdin: ChildStdin,
    boot: String,
    mut commands: mpsc::Receiver<Command>,
) {
    if let Err(e) = stdin.write_all(boot.as_bytes()).await {
        warn!(participant = %name, error = %e, "failed to send the participant spec");
        return;
    }
    while let Some(command) = commands.recv().await {
        let line = match protocol::encode(&command) {
            Ok(line) => line,
            Err(e) => {
                warn!(participant = %name, error = %e, "failed to encode control command");
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(participant = %name, error = %e, "control pipe closed");
            return;
        }
    }
    // handle dropped: closing stdin tells the participant to exit
}

/// Monitor-side view of one process.
struct Watch {
    name: String,
    pid: Option<u32>,
    state: StateCell,
    finished: Arc<Flag>,
    replies: Replies,
    reports: InboxSender,
}

impl Watch {
    fn apply(&self, line: &str) {
        match protocol::decode::<Report>(line) {
            Ok(Report::State { state }) => {
                debug!(participant = %self.name, %state, "state changed");
                self.state.set(state);
            }
            Ok(Report::ParamsUpdated { id, error }) => {
                if let Some(reply) = self.replies.lock().remove(&id) {
                    let _ = reply.send(error.map_or(Ok(()), Err));
                }
            }
            Err(e) => {
                warn!(participant = %self.name, error = %e, "ignoring stray output on the control pipe");
            }
        }
    }

    async fn read_reports(&self, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.apply(&line),
                Ok(None) => return,
                Err(e) => {
                    warn!(participant = %self.name, error = %e, "control pipe read failed");
                    return;
                }
            }
        }
    }

    async fn report_crash(&self, status: &str, last: LifecycleState) {
        let pid = self
            .pid
            .map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
        let report = ErrorReport {
            kind: "ProcessExit".to_string(),
            message: format!("participant process exited unexpectedly ({status})"),
            critical: true,
        };
        let trace = format!("{} (pid {pid}) exited with {status} while {last}", self.name);
        let message = Message::new(&self.name, Payload::Error { report, trace });
        if self.reports.send(message).await.is_err() {
            debug!(participant = %self.name, "orchestrator inbox closed");
        }
    }
}

async fn monitor(
    watch: Watch,
    mut child: Child,
    stdout: ChildStdout,
    mut kill: oneshot::Receiver<()>,
) -> Exit {
    let reading = watch.read_reports(stdout);
    tokio::pin!(reading);
    let killed = tokio::select! {
        () = &mut reading => false,
        Ok(()) = &mut kill => true,
    };
    if killed {
        if let Err(e) = child.start_kill() {
            warn!(participant = %watch.name, error = %e, "failed to kill participant process");
        }
    }

    let status = child.wait().await;
    let last = watch.state.get();
    let exit = match status {
        _ if killed => Exit::Killed,
        Ok(status) if status.success() && last == LifecycleState::Finished => Exit::Clean,
        Ok(status) => Exit::Crashed(status.to_string()),
        Err(e) => Exit::Crashed(format!("wait failed: {e}")),
    };
    match &exit {
        Exit::Clean => debug!(participant = %watch.name, "participant process exited"),
        Exit::Killed => warn!(participant = %watch.name, state = %last, "participant process killed"),
        Exit::Crashed(status) => {
            error!(participant = %watch.name, pid = ?watch.pid, state = %last, %status, "participant process died");
            watch.report_crash(status, last).await;
        }
    }

    watch.state.set(LifecycleState::Finished);
    watch.replies.lock().clear();
    watch.finished.raise();
    exit
}

/// Owns the handles of every spawned participant.
#[derive(Debug)]
pub struct Supervisor {
    launcher: ParticipantLauncher,
    reports: InboxSender,
    handles: Vec<WorkerHandle>,
}

impl Supervisor {
    /// Participants are started with `launcher`; crash reports go to `reports`.
    pub fn new(launcher: ParticipantLauncher, reports: InboxSender) -> Self {
        Self {
            launcher,
            reports,
            handles: Vec::new(),
        }
    }

    /// Starts the participant process for `spec`.
    pub fn spawn(&mut self, spec: &ParticipantSpec) -> FleetResult<()> {
        self.handles
            .push(spawn(spec, &self.launcher, self.reports.clone())?);
        Ok(())
    }

    /// Handle of the participant called `name`.
    pub fn get(&self, name: &str) -> Option<&WorkerHandle> {
        self.handles.iter().find(|h| h.name == name)
    }

    /// Every handle, in spawn order.
    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// Participant names, in spawn order.
    pub fn names(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.name.clone()).collect()
    }

    /// Raises every start flag.
    pub fn start_all(&self) {
        self.handles.iter().for_each(WorkerHandle::start);
    }

    /// Raises every stop flag.
    pub fn stop_all(&self) {
        self.handles.iter().for_each(WorkerHandle::stop);
    }

    /// Asks every participant to exit.
    pub fn exit_all(&self) {
        self.handles.iter().for_each(WorkerHandle::exit);
    }

    /// Joins every participant, collecting the ones that crashed or failed to finish in time.
    pub async fn join_all(&mut self, timeout: Duration) -> FleetResult<()> {
        let mut errors = Vec::new();
        for handle in &mut self.handles {
            if let Err(e) = handle.join(timeout).await {
                warn!(participant = %handle.name, error = %e, "participant did not finish cleanly");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FleetError::ShutdownFailed(errors))
        }
    }
}
