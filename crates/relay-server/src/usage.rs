//! Subscriber that derives cost from usage-bearing events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use relay_bus::Subscriber;
use relay_core::events::{Event, EventType};
use relay_telemetry::MetricsRecorder;

/// Per-model billing rates, in cents per 1k tokens.
#[derive(Clone, Copy, Debug)]
pub struct ModelRates {
    pub input_cents_per_1k: f64,
    pub output_cents_per_1k: f64,
}

/// Turns UsageReport events into billing counters and cost gauges on the
/// metrics recorder. Every other event type passes through untouched.
pub struct UsageMeter {
    metrics: Arc<MetricsRecorder>,
    rates: HashMap<String, ModelRates>,
    default_rates: ModelRates,
}

impl UsageMeter {
    pub fn new(metrics: Arc<MetricsRecorder>, default_rates: ModelRates) -> Self {
        Self {
            metrics,
            rates: HashMap::new(),
            default_rates,
        }
    }

    pub fn with_model_rates(mut self, model: impl Into<String>, rates: ModelRates) -> Self {
        let _ = self.rates.insert(model.into(), rates);
        self
    }

    fn rates_for(&self, model: Option<&str>) -> ModelRates {
        model
            .and_then(|m| self.rates.get(m).copied())
            .unwrap_or(self.default_rates)
    }
}

#[async_trait]
impl Subscriber for UsageMeter {
    fn name(&self) -> &str {
        "usage_meter"
    }

    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        if event.event_type != EventType::UsageReport {
            return Ok(());
        }

        let input_tokens = event
            .content
            .get("inputTokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output_tokens = event
            .content
            .get("outputTokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let model = event.content.get("model").and_then(|v| v.as_str());

        let rates = self.rates_for(model);
        let cost_cents = (input_tokens as f64 / 1000.0) * rates.input_cents_per_1k
            + (output_tokens as f64 / 1000.0) * rates.output_cents_per_1k;

        let session = event.session_id.as_str();
        let labels: &[(&str, &str)] = &[("session", session)];
        self.metrics
            .increment_counter("usage_input_tokens_total", labels, input_tokens);
        self.metrics
            .increment_counter("usage_output_tokens_total", labels, output_tokens);
        self.metrics.add_gauge("usage_cost_cents", labels, cost_cents);
        self.metrics
            .observe_histogram("usage_turn_cost_cents", &[], cost_cents);

        debug!(session_id = %event.session_id, input_tokens, output_tokens, cost_cents, "usage recorded");
        Ok(())
    }
}
