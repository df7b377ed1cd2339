//! The participant side of a supervised process: boot from stdin, run the main loop and
//! report lifecycle state back over stdout.

use super::protocol::{self, Body, Command, ParticipantSpec, Report};
use super::{LifecycleFlags, LifecycleState, StateCell, CONTROL_QUEUE};
use crate::error::{ConfigError, FleetError, FleetResult};
use crate::logging::{self, LogSettings};
use crate::participant::dispatch::{Builtin, Route};
use crate::participant::{Context, CriticalError, Dispatch, Launch, Worker};
use crate::recording::{BackendRegistry, Saver};
use crate::topology::Wiring;
use crate::transport::LinkSettings;
use crate::wire::{ErrorReport, Message};
use crate::workers::WorkerRegistry;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

const REPORT_FLUSH: Duration = Duration::from_secs(1);

/// Commands the stdin bridge hands to the main loop.
#[derive(Debug)]
pub enum ControlCommand {
    /// Replace constructor parameters; the participant replies with the outcome.
    UpdateParams {
        /// New parameters
        params: serde_json::Value,
        /// Receives the outcome
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Everything the participant main loop starts from.
pub struct Boot {
    /// Addresses and subscription edges
    pub wiring: Wiring,
    /// Socket tuning
    pub settings: LinkSettings,
    /// Start, stop and exit requests
    pub flags: LifecycleFlags,
    /// Written on every lifecycle transition
    pub state: StateCell,
    /// Parameter updates
    pub control: mpsc::Receiver<ControlCommand>,
}

/// Runs one participant process.
///
/// Reads the [`ParticipantSpec`] from the first stdin line, builds the worker or saver from
/// the registries, then runs it until it finishes. Returns an error if the participant could
/// not be built or wired; the process should then exit with a failure status.
pub async fn serve(workers: &WorkerRegistry, backends: &BackendRegistry) -> FleetResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let first = lines
        .next_line()
        .await?
        .ok_or_else(|| FleetError::Protocol("stdin closed before the participant spec".into()))?;
    let spec: ParticipantSpec = protocol::decode(&first)?;

    let log_settings = LogSettings::from_config(&spec.logging)
        .map_err(|e| FleetError::Configuration(ConfigError::Invalid(e)))?
        .with_stderr(true);
    logging::init(log_settings).map_err(FleetError::Protocol)?;

    let launch = match &spec.body {
        Body::Worker { module } => workers.create(module)?,
        Body::Saver { saver, sources } => Launch::new(Saver::new(
            backends.create(saver)?,
            sources.clone(),
            saver.cache_size,
        )),
    };
    let name = spec.wiring.name.clone();
    debug!(participant = %name, pid = std::process::id(), "participant process booted");

    let flags = LifecycleFlags::default();
    let state = StateCell::default();
    let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let (reports, reports_rx) = mpsc::channel(CONTROL_QUEUE);

    let writer = tokio::spawn(write_reports(reports_rx));
    let states = tokio::spawn(forward_states(state.subscribe(), reports.clone()));
    let reader = tokio::spawn(read_commands(
        name.clone(),
        lines,
        flags.clone(),
        control,
        reports.clone(),
    ));
    tokio::spawn(ignore_interrupts(name.clone()));

    let boot = Boot {
        wiring: spec.wiring,
        settings: LinkSettings::from(&spec.transport),
        flags,
        state,
        control: control_rx,
    };
    let outcome = launch.into_future(boot).await;

    reader.abort();
    let _ = states.await;
    drop(reports);
    if tokio::time::timeout(REPORT_FLUSH, writer).await.is_err() {
        warn!(participant = %name, "control pipe did not drain");
    }
    outcome
}

async fn read_commands(
    name: String,
    mut lines: Lines<BufReader<Stdin>>,
    flags: LifecycleFlags,
    control: mpsc::Sender<ControlCommand>,
    reports: mpsc::Sender<Report>,
) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(participant = %name, "control pipe closed");
                break;
            }
            Err(e) => {
                warn!(participant = %name, error = %e, "control pipe read failed");
                break;
            }
        };
        match protocol::decode::<Command>(&line) {
            Ok(Command::Start) => {
                flags.stop.clear();
                flags.start.raise();
            }
            Ok(Command::Stop) => {
                flags.start.clear();
                flags.stop.raise();
            }
            Ok(Command::Exit) => flags.exit.raise(),
            Ok(Command::UpdateParams { id, params }) => {
                let (reply, outcome) = oneshot::channel();
                if control
                    .send(ControlCommand::UpdateParams { params, reply })
                    .await
                    .is_err()
                {
                    break;
                }
                let reports = reports.clone();
                tokio::spawn(async move {
                    let error = match outcome.await {
                        Ok(Ok(())) => None,
                        Ok(Err(reason)) => Some(reason),
                        Err(_) => Some("participant dropped the request".to_string()),
                    };
                    let _ = reports.send(Report::ParamsUpdated { id, error }).await;
                });
            }
            Err(e) => warn!(participant = %name, error = %e, "ignoring malformed control line"),
        }
    }
    flags.exit.raise();
}

async fn forward_states(mut states: watch::Receiver<LifecycleState>, reports: mpsc::Sender<Report>) {
    loop {
        let state = *states.borrow_and_update();
        if reports.send(Report::State { state }).await.is_err() {
            return;
        }
        if state == LifecycleState::Finished || states.changed().await.is_err() {
            return;
        }
    }
}

async fn write_reports(mut reports: mpsc::Receiver<Report>) {
    let mut stdout = tokio::io::stdout();
    while let Some(report) = reports.recv().await {
        let line = match protocol::encode(&report) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode report");
                continue;
            }
        };
        if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            return;
        }
    }
}

/// Ctrl+C reaches the whole process group; the orchestrator drives shutdown.
async fn ignore_interrupts(name: String) {
    while tokio::signal::ctrl_c().await.is_ok() {
        debug!(participant = %name, "interrupt ignored");
    }
}

/// A caught error or panic from user code.
#[derive(Debug)]
enum Failure {
    Error(anyhow::Error),
    Panic(String),
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn guard<F>(fut: F) -> Result<(), Failure>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Failure::Error(e)),
        Err(payload) => Err(Failure::Panic(panic_message(payload))),
    }
}

fn guard_sync<F>(f: F) -> Result<(), Failure>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Failure::Error(e)),
        Err(payload) => Err(Failure::Panic(panic_message(payload))),
    }
}

/// Builds the ERROR payload for a failure: a structured description plus a non-empty trace.
fn describe(participant: &str, phase: &str, failure: Failure) -> (ErrorReport, String) {
    match failure {
        Failure::Error(e) => {
            let critical = e.chain().any(|cause| cause.is::<CriticalError>());
            let report = ErrorReport {
                kind: if critical { "CriticalError" } else { "Error" }.to_string(),
                message: e.to_string(),
                critical,
            };
            (report, format!("{participant} failed in {phase}: {e:?}"))
        }
        Failure::Panic(message) => {
            let trace = format!("{participant} panicked in {phase}: {message}");
            let report = ErrorReport {
                kind: "Panic".to_string(),
                message,
                critical: false,
            };
            (report, trace)
        }
    }
}

fn report_failure(ctx: &Context, phase: &str, failure: Failure) {
    let (report, trace) = describe(ctx.name(), phase, failure);
    error!(participant = %ctx.name(), phase, kind = %report.kind, critical = report.critical, "{}", report.message);
    if let Err(e) = ctx.report_error(report, trace) {
        warn!(participant = %ctx.name(), error = %e, "could not forward error report");
    }
}

fn dispatch_message<W: Worker>(
    worker: &mut W,
    ctx: &mut Context,
    dispatch: &Dispatch<W>,
    message: &Message,
) {
    match dispatch.route(message) {
        Route::Builtin(Builtin::Exit) => {
            debug!(participant = %ctx.name(), source = message.source(), "exit requested");
            ctx.request_exit();
        }
        Route::Builtin(Builtin::TestConnection) => ctx.answer_connection_check(),
        Route::Handler(handler) => {
            let phase = format!("handler for {}", message.kind());
            if let Err(failure) = guard_sync(|| handler(worker, ctx, message)) {
                report_failure(ctx, &phase, failure);
            }
        }
        Route::UnknownEvent => {
            debug!(participant = %ctx.name(), event = ?message.event_name(), "no handler for event");
        }
        Route::Unhandled => {
            warn!(participant = %ctx.name(), topic = %message.topic(), source = message.source(), "no handler for topic, dropping message");
        }
    }
}

fn apply_control<W: Worker>(worker: &mut W, name: &str, command: ControlCommand) {
    match command {
        ControlCommand::UpdateParams { params, reply } => {
            let outcome = match guard_sync(|| worker.update_params(&params)) {
                Ok(()) => {
                    info!(participant = %name, "parameters updated");
                    Ok(())
                }
                Err(Failure::Error(e)) => Err(format!("{e:#}")),
                Err(Failure::Panic(message)) => Err(format!("panicked: {message}")),
            };
            // the requester may have timed out already
            let _ = reply.send(outcome);
        }
    }
}

/// The participant main loop.
///
/// Fails only if the capabilities cannot be set up; everything after that is reported to
/// the orchestrator as ERROR messages.
pub(crate) async fn run_participant<W: Worker>(mut worker: W, boot: Boot) -> FleetResult<()> {
    let Boot {
        wiring,
        settings,
        flags,
        state,
        mut control,
    } = boot;
    let name = wiring.name.clone();

    let mut ctx = match Context::connect(&wiring, &settings).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(participant = %name, error = %e, "failed to set up capabilities");
            return Err(e);
        }
    };

    let mut dispatch = Dispatch::new();
    if let Err(e) = W::register(&mut dispatch) {
        report_failure(&ctx, "handler registration", Failure::Error(e.into()));
    }

    state.set(LifecycleState::Setup);
    if let Err(failure) = guard(worker.setup(&mut ctx)).await {
        report_failure(&ctx, "setup", failure);
    }

    state.set(LifecycleState::Running);
    info!(participant = %name, "running");
    loop {
        if flags.exit.is_raised() || ctx.exit_requested() {
            break;
        }
        if flags.start.take() {
            if let Err(failure) = guard(worker.on_start(&mut ctx)).await {
                report_failure(&ctx, "on_start", failure);
            }
        }
        if flags.stop.take() {
            if let Err(failure) = guard(worker.on_stop(&mut ctx)).await {
                report_failure(&ctx, "on_stop", failure);
            }
        }
        while let Ok(command) = control.try_recv() {
            apply_control(&mut worker, &name, command);
        }

        let timeout = worker.poll_timeout();
        for message in ctx.poll(timeout).await {
            dispatch_message(&mut worker, &mut ctx, &dispatch, &message);
        }
        if flags.exit.is_raised() || ctx.exit_requested() {
            break;
        }

        if let Err(failure) = guard(worker.step(&mut ctx)).await {
            report_failure(&ctx, "step", failure);
        }
    }

    state.set(LifecycleState::Cleanup);
    if let Err(failure) = guard(worker.cleanup(&mut ctx)).await {
        report_failure(&ctx, "cleanup", failure);
    }
    state.set(LifecycleState::Finished);
    info!(participant = %name, "finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_describe_marks_critical() {
        let err = anyhow!(CriticalError("interlock open".into())).context("while arming");
        let (report, trace) = describe("laser", "step", Failure::Error(err));
        assert!(report.critical);
        assert_eq!(report.kind, "CriticalError");
        assert!(trace.contains("interlock open"));

        let (report, trace) = describe("cam", "setup", Failure::Error(anyhow!("no device")));
        assert!(!report.critical);
        assert_eq!(report.message, "no device");
        assert!(trace.starts_with("cam failed in setup"));
    }

    #[test]
    fn test_guard_sync_catches_panics() {
        let result = guard_sync(|| panic!("boom"));
        match result {
            Err(Failure::Panic(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_guard_catches_async_errors() {
        assert!(guard(async { Ok(()) }).await.is_ok());
        assert!(matches!(
            guard(async { Err(anyhow!("nope")) }).await,
            Err(Failure::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_state_forwarding_ends_on_finished() {
        let state = StateCell::default();
        let (reports, mut rx) = mpsc::channel(8);
        let forwarding = tokio::spawn(forward_states(state.subscribe(), reports));

        state.set(LifecycleState::Running);
        tokio::task::yield_now().await;
        state.set(LifecycleState::Finished);
        tokio::time::timeout(Duration::from_secs(1), forwarding)
            .await
            .unwrap()
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(Report::State { state }) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(seen.first(), Some(&LifecycleState::Idle));
        assert_eq!(seen.last(), Some(&LifecycleState::Finished));
    }

    #[tokio::test]
    async fn test_update_params_reports_rejection() {
        struct Fixed;

        #[async_trait::async_trait]
        impl Worker for Fixed {}

        let (reply, outcome) = oneshot::channel();
        apply_control(
            &mut Fixed,
            "fixed",
            ControlCommand::UpdateParams {
                params: serde_json::json!({"gain": 1}),
                reply,
            },
        );
        let reason = outcome.await.unwrap().unwrap_err();
        assert!(reason.contains("no adjustable parameters"));
    }
}
