//! Re-publishes upstream timestamped data as indexed data.

use crate::error::ConfigError;
use crate::participant::{Context, Dispatch, Worker};
use crate::wire::{Mapping, Message, Payload, Topic};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Parameters of [`Relay`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RelayParams {
    /// Applied to every numeric value
    pub scale: f64,
    /// Prefix numeric keys with the upstream name, `<source>.<key>`
    pub prefix_source: bool,
}

impl Default for RelayParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            prefix_source: false,
        }
    }
}

/// Republishes upstream data under its own name.
pub struct Relay {
    params: RelayParams,
    index: i64,
}

impl Relay {
    /// A relay with `params`.
    pub fn new(params: RelayParams) -> Self {
        Self { params, index: 0 }
    }

    fn transform(&self, source: &str, data: &Mapping) -> Mapping {
        data.iter()
            .map(|(key, value)| {
                let key = if self.params.prefix_source {
                    format!("{source}.{key}")
                } else {
                    key.clone()
                };
                let value = match value.as_f64() {
                    Some(v) => json!(v * self.params.scale),
                    None => value.clone(),
                };
                (key, value)
            })
            .collect()
    }

    fn on_data(&mut self, ctx: &mut Context, message: &Message) -> anyhow::Result<()> {
        if let Payload::Timestamped { data, .. } = message.payload() {
            let out = self.transform(message.source(), data);
            ctx.publish_indexed(self.index, out)?;
            self.index += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for Relay {
    fn register(dispatch: &mut Dispatch<Self>) -> Result<(), ConfigError> {
        dispatch.on_topic(Topic::Data, Self::on_data)
    }

    fn update_params(&mut self, params: &Value) -> anyhow::Result<()> {
        self.params = super::parse_params(params)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_scales_numbers_only() {
        let relay = Relay::new(RelayParams {
            scale: 2.0,
            prefix_source: true,
        });
        let Value::Object(data) = json!({"v": 1.5, "unit": "mW"}) else {
            unreachable!()
        };
        let out = relay.transform("meter", &data);
        assert_eq!(out["meter.v"], json!(3.0));
        assert_eq!(out["meter.unit"], json!("mW"));
    }
}
