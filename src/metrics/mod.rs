use opentelemetry::{
    global,
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
};
use prometheus::{default_registry, Encoder, TextEncoder};

use crate::errors::{ExchangeError, ExchangeResult};

/// Evaluate `$body` and record how long it took, in seconds, on
/// `$histogram`.
#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
///
/// Until this is called producers record into a no-op meter.
pub fn initialize_metrics() -> ExchangeResult<()> {
    // The default registry is a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("shuffle_exchange")
        .build()
        .map_err(|err| ExchangeError::Telemetry(err.to_string()))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25,
                        0.5, 1.0, 2.5, 5.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| ExchangeError::Telemetry(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Everything in the default registry, in the Prometheus text format.
pub fn metrics_text() -> ExchangeResult<String> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&default_registry().gather(), &mut buf)
        .map_err(|err| ExchangeError::Telemetry(err.to_string()))?;
    String::from_utf8(buf).map_err(|err| ExchangeError::Telemetry(err.to_string()))
}

#[test]
fn producer_counters_are_exported() {
    use crate::batch::testing::{int_schema, seq_batch};
    use crate::channel::{ExchangePairId, WorkerId};
    use crate::config::ExchangeConfig;
    use crate::operator::{BatchSource, Operator};
    use crate::producer::testing::RecordingFactory;
    use crate::producer::Producer;

    initialize_metrics().unwrap();
    let child = BatchSource::new(int_schema(1), vec![seq_batch(6)]);
    let mut producer = Producer::collect(Box::new(child), ExchangePairId(1), WorkerId(4)).unwrap();
    let mut factory = RecordingFactory::default();
    producer
        .init(WorkerId(4), ExchangeConfig::default(), &mut factory)
        .unwrap();
    while !producer.eos() {
        producer.next_ready().unwrap();
    }

    let text = metrics_text().unwrap();
    assert!(text.contains("shuffle_exchange_tuples_written"));
    assert!(text.contains("shuffle_exchange_partition_batch_duration_seconds"));
}
