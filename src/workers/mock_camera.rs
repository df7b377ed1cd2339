//! Simulated camera producing `u8` frames.

use crate::error::ConfigError;
use crate::participant::{Context, Dispatch, Worker};
use crate::wire::{Buffer, Message, Topic};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Parameters of [`MockCamera`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MockCameraParams {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frame period; without one the camera exposes on every TRIGGER.
    #[serde(with = "humantime_serde")]
    pub period: Option<Duration>,
}

impl Default for MockCameraParams {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            period: Some(Duration::from_millis(33)),
        }
    }
}

/// Publishes a moving diagonal gradient, one frame per period or trigger.
pub struct MockCamera {
    params: MockCameraParams,
    frame: i64,
    next_frame: Instant,
}

impl MockCamera {
    /// A camera with `params`.
    pub fn new(params: MockCameraParams) -> Self {
        Self {
            params,
            frame: 0,
            next_frame: Instant::now(),
        }
    }

    fn render(&self) -> anyhow::Result<Buffer> {
        let (w, h) = (self.params.width, self.params.height);
        let shift = self.frame as u32;
        let pixels = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x.wrapping_add(y).wrapping_add(shift) % 256) as u8))
            .collect();
        Ok(Buffer::from_u8(vec![h, w], pixels)?)
    }

    fn expose(&mut self, ctx: &Context) -> anyhow::Result<()> {
        let buffer = self.render()?;
        ctx.publish_frame(self.frame, buffer)?;
        self.frame += 1;
        Ok(())
    }

    fn on_trigger(&mut self, ctx: &mut Context, _message: &Message) -> anyhow::Result<()> {
        if self.params.period.is_none() {
            self.expose(ctx)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for MockCamera {
    fn register(dispatch: &mut Dispatch<Self>) -> Result<(), ConfigError> {
        dispatch.on_topic(Topic::Trigger, Self::on_trigger)
    }

    async fn step(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let Some(period) = self.params.period else {
            return Ok(());
        };
        if Instant::now() < self.next_frame {
            return Ok(());
        }
        self.next_frame = Instant::now() + period;
        self.expose(ctx)
    }

    fn update_params(&mut self, params: &serde_json::Value) -> anyhow::Result<()> {
        self.params = super::parse_params(params)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_shape_and_pattern() {
        let mut camera = MockCamera::new(MockCameraParams {
            width: 3,
            height: 2,
            period: None,
        });
        let buffer = camera.render().unwrap();
        assert_eq!(buffer.shape(), [2, 3]);
        assert_eq!(buffer.data().as_ref(), [0, 1, 2, 1, 2, 3]);

        camera.frame = 255;
        let shifted = camera.render().unwrap();
        assert_eq!(shifted.data()[0], 255);
        assert_eq!(shifted.data()[1], 0);
    }
}
