use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{ExchangeError, ExchangeResult};

use super::TracerBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

/// Send traces to an OpenTelemetry collector:
/// https://opentelemetry.io/docs/collector/
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpTracingConfig {
    /// Identifies this service in the collected traces.
    pub service_name: String,
    /// Collector URL, defaults to `http://127.0.0.1:4317`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub protocol: OtlpProtocol,
    /// 1.0 samples every trace, 0.0 almost none.
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl OtlpTracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            url: None,
            protocol: OtlpProtocol::default(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> ExchangeResult<Tracer> {
        let mut exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_protocol(match self.protocol {
                OtlpProtocol::Grpc => opentelemetry_otlp::Protocol::Grpc,
                OtlpProtocol::Http => opentelemetry_otlp::Protocol::HttpBinary,
            });

        if let Some(endpoint) = self.url.as_ref() {
            exporter = exporter.with_endpoint(endpoint);
        }

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(|err| ExchangeError::Telemetry(format!("installing OTLP tracer: {err}")))
    }
}

#[test]
fn config_defaults() {
    let conf: super::TracingConfig =
        serde_json::from_str(r#"{"type":"Otlp","serviceName":"exchange"}"#).unwrap();
    assert_eq!(
        conf,
        super::TracingConfig::Otlp(OtlpTracingConfig::new("exchange"))
    );

    let conf: OtlpTracingConfig = serde_json::from_str(
        r#"{"serviceName":"x","url":"http://collector:4318","protocol":"HTTP","samplingRatio":0.5}"#,
    )
    .unwrap();
    assert_eq!(conf.protocol, OtlpProtocol::Http);
    assert_eq!(conf.sampling_ratio, 0.5);
}
