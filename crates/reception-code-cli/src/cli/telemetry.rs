//! # Telemetry
//!
//! Log output always goes through `tracing_subscriber::fmt` on stderr, so
//! command results on stdout stay machine-readable. The filter comes from
//! `RUST_LOG` and defaults to `info`.
//!
//! With the `metrics` feature the allocator's statistics are exported as
//! OpenTelemetry counters through the stdout exporter when the command
//! finishes:
//!
//! ```bash
//! cargo run -p reception-code-cli --features metrics -- allocate --prefix T
//! ```

use reception_code::StatsSnapshot;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope,
    metrics::{Counter, Meter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
    #[cfg(feature = "metrics")]
    handles: MetricHandles,
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    let providers = {
        let meter_provider = init_metrics();
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let scope = InstrumentationScope::builder("reception-code")
            .with_version(env!("CARGO_PKG_VERSION"))
            .build();
        let handles = MetricHandles::new(&opentelemetry::global::meter_with_scope(scope));
        TelemetryProviders {
            meter_provider,
            handles,
        }
    };

    #[cfg(not(feature = "metrics"))]
    let providers = TelemetryProviders {};

    Ok(providers)
}

impl TelemetryProviders {
    /// Exports `stats` and flushes every provider.
    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    pub fn shutdown(self, stats: StatsSnapshot) {
        #[cfg(feature = "tracing")]
        tracing::debug!(?stats, "allocation statistics");

        #[cfg(feature = "metrics")]
        {
            self.handles.record(&stats);
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    use opentelemetry_stdout::MetricExporter;

    let reader = sdkmetrics::PeriodicReader::builder(MetricExporter::default())
        .with_interval(std::time::Duration::from_secs(5))
        .build();
    sdkmetrics::SdkMeterProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name("reception-code")
                .build(),
        )
        .with_reader(reader)
        .build()
}

#[cfg(feature = "metrics")]
struct MetricHandles {
    attempts: Counter<u64>,
    retries: Counter<u64>,
    conflicts: Counter<u64>,
    allocations: Counter<u64>,
}

#[cfg(feature = "metrics")]
impl MetricHandles {
    fn new(meter: &Meter) -> Self {
        Self {
            attempts: meter
                .u64_counter("allocation_attempts")
                .with_description("Transactions started by the allocator")
                .build(),
            retries: meter
                .u64_counter("allocation_retries")
                .with_description("Attempts retried after a conflict")
                .build(),
            conflicts: meter
                .u64_counter("allocation_conflicts")
                .with_description("Allocations that ran out of attempts")
                .build(),
            allocations: meter
                .u64_counter("allocations")
                .with_description("Codes committed")
                .build(),
        }
    }

    fn record(&self, stats: &StatsSnapshot) {
        self.attempts.add(stats.attempts, &[]);
        self.retries.add(stats.retries, &[]);
        self.conflicts.add(stats.conflicts, &[]);
        self.allocations.add(stats.allocations, &[]);
    }
}
