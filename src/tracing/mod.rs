//! Tracing and logging setup.
//!
//! Logging to stdout is always enabled, at least at the "ERROR" level.
//! Exporting traces is optional and off by default.
//!
//! Each tracing backend implements [`TracerBuilder`], which only has to
//! return the `Tracer` the OpenTelemetry layer is built on.
use opentelemetry::sdk::trace::Tracer;
use serde::{Deserialize, Serialize};
use tokio::runtime::EnterGuard;
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, Layer, Registry};

use crate::errors::{tracked_bad_request, ExchangeError, ExchangeResult};

mod otlp_tracing;

pub use otlp_tracing::{OtlpProtocol, OtlpTracingConfig};

const TARGET: &str = "shuffle_exchange";

/// Where to send the traces emitted by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TracingConfig {
    Otlp(OtlpTracingConfig),
}

impl TracingConfig {
    fn builder(&self) -> &dyn TracerBuilder {
        match self {
            Self::Otlp(conf) => conf,
        }
    }
}

trait TracerBuilder {
    fn build(&self) -> ExchangeResult<Tracer>;
}

/// Parse one of `trace|debug|info|warn|error`, case insensitive.
/// Defaults to `error`.
pub fn parse_log_level(level: Option<&str>) -> ExchangeResult<LevelFilter> {
    let Some(level) = level else {
        return Ok(LevelFilter::ERROR);
    };
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        other => Err(tracked_bad_request(&format!("unknown log level: {other}"))),
    }
}

/// Keeps the tokio runtime the trace exporter runs on alive as long as
/// the struct itself.
pub struct ExchangeTracer {
    rt: tokio::runtime::Runtime,
}

impl ExchangeTracer {
    pub fn new() -> ExchangeResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| ExchangeError::Telemetry(format!("starting tracing runtime: {err}")))?;
        Ok(Self { rt })
    }

    /// Install the global subscriber. Returns a guard that you have to
    /// keep in scope for the whole execution of the code you want to
    /// trace.
    pub fn setup(
        &self,
        conf: Option<TracingConfig>,
        log_level: Option<&str>,
    ) -> ExchangeResult<EnterGuard<'_>> {
        let log_level = parse_log_level(log_level)?;
        let guard = self.rt.enter();

        // The batch exporter has to be installed from within the runtime.
        let initializer = async move {
            let logs = tracing_subscriber::fmt::Layer::default()
                .compact()
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_filter(Targets::new().with_target(TARGET, log_level));

            match conf {
                Some(conf) => {
                    let tracer = conf.builder().build()?;
                    let telemetry = tracing_opentelemetry::layer()
                        .with_tracer(tracer)
                        .with_filter(Targets::new().with_target(TARGET, LevelFilter::TRACE));
                    set_global_subscriber(Registry::default().with(logs).with(telemetry));
                }
                None => set_global_subscriber(Registry::default().with(logs)),
            }
            Ok::<_, ExchangeError>(())
        };
        self.rt
            .block_on(self.rt.spawn(initializer))
            .map_err(|err| ExchangeError::Telemetry(format!("tracing setup task failed: {err}")))??;
        Ok(guard)
    }
}

// Setting the global subscriber fails if one was already set, which
// happens in tests and when a process runs several queries.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels() {
    assert_eq!(parse_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(parse_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert_eq!(parse_log_level(Some("warn")).unwrap(), LevelFilter::WARN);
    assert!(parse_log_level(Some("verbose"))
        .unwrap_err()
        .is_bad_request());
}

#[test]
fn setup_without_exporter_twice() {
    let tracer = ExchangeTracer::new().unwrap();
    drop(tracer.setup(None, Some("info")).unwrap());
    // The second install only warns.
    drop(tracer.setup(None, None).unwrap());
    assert!(tracer.setup(None, Some("loud")).is_err());
}
