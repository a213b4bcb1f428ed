//! Prometheus metrics middleware
//!
//! Counts commands and records their latency, labelled by command name.
//! `gather()` renders the registry in the Prometheus text format.

use crate::command::{Command, CommandContext, CommandResult};
use crate::error::{Error, Result};
use crate::middleware::{HookSet, Middleware, MiddlewareBinding};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

const METRICS_START: &str = "_metrics_start";

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Configuration(format!("metrics: {}", e))
}

/// Per-command counters and latency histogram
pub struct MetricsMiddleware {
    binding: MiddlewareBinding,
    registry: Registry,
    commands_total: CounterVec,
    command_duration: HistogramVec,
}

impl MetricsMiddleware {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let commands_total = CounterVec::new(
            Opts::new("kvindex_commands_total", "Total number of store commands"),
            &["command"],
        )
        .map_err(metrics_error)?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new("kvindex_command_duration_seconds", "Store command duration")
                .buckets(vec![0.000_01, 0.000_1, 0.001, 0.01, 0.1, 1.0]),
            &["command"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(commands_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(command_duration.clone()))
            .map_err(metrics_error)?;

        Ok(MetricsMiddleware {
            binding: MiddlewareBinding::new(),
            registry,
            commands_total,
            command_duration,
        })
    }

    /// Commands seen for `command` so far
    pub fn command_total(&self, command: &str) -> f64 {
        self.commands_total.with_label_values(&[command]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather metrics in Prometheus format
    pub fn gather(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Configuration(format!("metrics: {}", e)))
    }
}

impl Middleware for MetricsMiddleware {
    fn binding(&self) -> &MiddlewareBinding {
        &self.binding
    }

    fn hooks(&self) -> HookSet {
        HookSet::BOTH
    }

    fn pre_command(
        &self,
        _command: &mut Command,
        context: &mut CommandContext,
    ) -> Result<Option<CommandResult>> {
        context.insert(METRICS_START, Instant::now());
        Ok(None)
    }

    fn post_command(
        &self,
        command: &Command,
        result: CommandResult,
        context: &mut CommandContext,
    ) -> Result<CommandResult> {
        let name = command.name.as_str();
        self.commands_total.with_label_values(&[name]).inc();
        if let Some(start) = context.get::<Instant>(METRICS_START) {
            self.command_duration
                .with_label_values(&[name])
                .observe(start.elapsed().as_secs_f64());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandName;
    use crate::middleware::PreparedMiddlewares;
    use crate::types::Value;
    use std::sync::Arc;

    #[test]
    fn test_commands_counted() {
        let metrics = Arc::new(MetricsMiddleware::new().unwrap());
        let chain: Vec<Arc<dyn Middleware>> = vec![metrics.clone()];
        let prepared = PreparedMiddlewares::prepare(1, &chain).unwrap();

        for _ in 0..2 {
            prepared
                .run(
                    Command::new(CommandName::Get, vec!["k".into()]),
                    &mut CommandContext::new(),
                    |_| Ok(Value::Nil),
                )
                .unwrap();
        }

        assert_eq!(metrics.command_total("get"), 2.0);
        let output = metrics.gather().unwrap();
        assert!(output.contains("kvindex_commands_total"));
        assert!(output.contains("kvindex_command_duration_seconds"));
    }
}
