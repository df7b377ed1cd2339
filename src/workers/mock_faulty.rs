//! Worker with controllable failure injection.
//!
//! Exercises every error path of a participant without real hardware:
//! - `setup_error`: setup fails with this message
//! - `setup_delay`: setup holds the loop this long, so the worker answers nothing meanwhile
//! - `abort_after`: the whole process aborts once this long has passed since setup began,
//!   checked when setup ends and on every `step`
//! - events `inject_error`, `inject_panic`, `inject_critical` and `inject_abort` fail the
//!   handler in the named way
//! - event `fail_next_step`: the next `step` fails, once

use crate::error::ConfigError;
use crate::participant::{Context, CriticalError, Dispatch, Worker};
use crate::wire::Message;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Event: the handler returns an error.
pub const INJECT_ERROR: &str = "inject_error";
/// Event: the handler panics.
pub const INJECT_PANIC: &str = "inject_panic";
/// Event: the handler returns a [`CriticalError`].
pub const INJECT_CRITICAL: &str = "inject_critical";
/// Event: the process aborts.
pub const INJECT_ABORT: &str = "inject_abort";
/// Event: the next step fails.
pub const FAIL_NEXT_STEP: &str = "fail_next_step";

/// Parameters of [`MockFaulty`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MockFaultyParams {
    /// Setup fails with this message
    pub setup_error: Option<String>,
    /// Setup sleeps this long first
    #[serde(with = "humantime_serde")]
    pub setup_delay: Option<Duration>,
    /// The process aborts this long after setup began
    #[serde(with = "humantime_serde")]
    pub abort_after: Option<Duration>,
}

/// Fails on demand.
pub struct MockFaulty {
    params: MockFaultyParams,
    setup_at: Option<Instant>,
    fail_next_step: bool,
}

impl MockFaulty {
    /// A worker that fails only where `params` say so.
    pub fn new(params: MockFaultyParams) -> Self {
        Self {
            params,
            setup_at: None,
            fail_next_step: false,
        }
    }

    fn on_error(&mut self, _ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        bail!("injected error from {}", message.source())
    }

    #[allow(clippy::panic)]
    fn on_panic(&mut self, _ctx: &mut Context, _message: &Message) -> anyhow::Result<()> {
        panic!("injected panic")
    }

    fn on_critical(&mut self, _ctx: &mut Context, _message: &Message) -> anyhow::Result<()> {
        Err(anyhow!(CriticalError("injected critical failure".into())))
    }

    fn on_abort(&mut self, ctx: &mut Context, _message: &Message) -> anyhow::Result<()> {
        abort(ctx.name())
    }

    fn abort_due(&self) -> bool {
        match (self.params.abort_after, self.setup_at) {
            (Some(after), Some(began)) => began.elapsed() >= after,
            _ => false,
        }
    }

    fn on_fail_next_step(&mut self, _ctx: &mut Context, _message: &Message) -> anyhow::Result<()> {
        self.fail_next_step = true;
        Ok(())
    }
}

fn abort(name: &str) -> ! {
    error!(participant = %name, "aborting process on request");
    std::process::abort()
}

#[async_trait]
impl Worker for MockFaulty {
    fn register(dispatch: &mut Dispatch<Self>) -> Result<(), ConfigError> {
        dispatch.on_event(INJECT_ERROR, Self::on_error)?;
        dispatch.on_event(INJECT_PANIC, Self::on_panic)?;
        dispatch.on_event(INJECT_CRITICAL, Self::on_critical)?;
        dispatch.on_event(INJECT_ABORT, Self::on_abort)?;
        dispatch.on_event(FAIL_NEXT_STEP, Self::on_fail_next_step)
    }

    async fn setup(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        self.setup_at = Some(Instant::now());
        if let Some(delay) = self.params.setup_delay {
            info!(participant = %ctx.name(), ?delay, "holding setup");
            tokio::time::sleep(delay).await;
        }
        if self.abort_due() {
            abort(ctx.name());
        }
        match &self.params.setup_error {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }

    async fn step(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        if self.abort_due() {
            abort(ctx.name());
        }
        if std::mem::take(&mut self.fail_next_step) {
            bail!("injected step failure");
        }
        Ok(())
    }

    fn update_params(&mut self, params: &serde_json::Value) -> anyhow::Result<()> {
        self.params = super::parse_params(params)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_parse() {
        let params: MockFaultyParams = super::super::parse_params(&json!({
            "setup_error": "camera not found",
            "abort_after": "50ms",
        }))
        .unwrap();
        assert_eq!(params.setup_error.as_deref(), Some("camera not found"));
        assert_eq!(params.abort_after, Some(Duration::from_millis(50)));
        assert!(params.setup_delay.is_none());
    }

    #[test]
    fn test_registers_every_injection_event() {
        let mut dispatch = Dispatch::<MockFaulty>::new();
        MockFaulty::register(&mut dispatch).unwrap();
        assert_eq!(
            dispatch.events(),
            [FAIL_NEXT_STEP, INJECT_ABORT, INJECT_CRITICAL, INJECT_ERROR, INJECT_PANIC]
        );
    }

    #[test]
    fn test_abort_is_due_only_after_setup_began() {
        let mut worker = MockFaulty::new(MockFaultyParams {
            abort_after: Some(Duration::ZERO),
            ..MockFaultyParams::default()
        });
        assert!(!worker.abort_due());
        worker.setup_at = Some(Instant::now());
        assert!(worker.abort_due());

        worker.params.abort_after = Some(Duration::from_secs(3600));
        assert!(!worker.abort_due());
    }

    #[test]
    fn test_update_params_rejects_unknown_keys() {
        let mut worker = MockFaulty::new(MockFaultyParams::default());
        assert!(worker.update_params(&json!({"explode": true})).is_err());
        worker
            .update_params(&json!({"setup_error": "again"}))
            .unwrap();
        assert_eq!(worker.params.setup_error.as_deref(), Some("again"));
    }
}
