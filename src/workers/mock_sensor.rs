//! Simulated scalar sensor.

use crate::error::ConfigError;
use crate::participant::{Context, Dispatch, Worker};
use crate::wire::{Mapping, Message, Topic};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::debug;

/// Parameters of [`MockSensor`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MockSensorParams {
    /// Sample period; without one the sensor samples on every TRIGGER.
    #[serde(with = "humantime_serde")]
    pub period: Option<Duration>,
    /// One random value per channel per sample
    pub channels: Vec<String>,
    /// Added to every sample
    pub offset: f64,
    /// Peak-to-peak noise
    pub amplitude: f64,
    /// Only sample between start and stop
    pub gated: bool,
}

impl Default for MockSensorParams {
    fn default() -> Self {
        Self {
            period: Some(Duration::from_millis(100)),
            channels: vec!["value".to_string()],
            offset: 0.0,
            amplitude: 1.0,
            gated: false,
        }
    }
}

/// Publishes timestamped random values.
pub struct MockSensor {
    params: MockSensorParams,
    rng: StdRng,
    running: bool,
    next_sample: Instant,
    samples: u64,
}

impl MockSensor {
    /// A sensor with `params`.
    pub fn new(params: MockSensorParams) -> Self {
        Self {
            params,
            rng: StdRng::from_entropy(),
            running: false,
            next_sample: Instant::now(),
            samples: 0,
        }
    }

    fn active(&self) -> bool {
        !self.params.gated || self.running
    }

    fn sample(&mut self, ctx: &Context) -> anyhow::Result<()> {
        let half = self.params.amplitude.abs() / 2.0;
        let mut values = Mapping::new();
        for channel in &self.params.channels {
            let noise = if half > 0.0 {
                self.rng.gen_range(-half..=half)
            } else {
                0.0
            };
            values.insert(channel.clone(), json!(self.params.offset + noise));
        }
        ctx.publish_timestamped(values)?;
        self.samples += 1;
        Ok(())
    }

    fn on_trigger(&mut self, ctx: &mut Context, _message: &Message) -> anyhow::Result<()> {
        if self.params.period.is_none() && self.active() {
            self.sample(ctx)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for MockSensor {
    fn register(dispatch: &mut Dispatch<Self>) -> Result<(), ConfigError> {
        dispatch.on_topic(Topic::Trigger, Self::on_trigger)
    }

    async fn step(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let Some(period) = self.params.period else {
            return Ok(());
        };
        if !self.active() || Instant::now() < self.next_sample {
            return Ok(());
        }
        self.next_sample = Instant::now() + period;
        self.sample(ctx)
    }

    async fn on_start(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        debug!(participant = %ctx.name(), "sampling enabled");
        self.running = true;
        Ok(())
    }

    async fn on_stop(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        debug!(participant = %ctx.name(), samples = self.samples, "sampling disabled");
        self.running = false;
        Ok(())
    }

    fn update_params(&mut self, params: &serde_json::Value) -> anyhow::Result<()> {
        self.params = super::parse_params(params)?;
        self.next_sample = Instant::now();
        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        self.params
            .period
            .map_or(crate::participant::DEFAULT_POLL_TIMEOUT, |p| {
                p.min(crate::participant::DEFAULT_POLL_TIMEOUT)
            })
    }
}
