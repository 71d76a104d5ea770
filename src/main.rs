use std::io::IsTerminal;
use std::time::Duration;

use clap::Parser;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use tracing::info;
use tracing_subscriber::prelude::*;

use tusistor::config::Settings;
use tusistor::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "tusistor.toml")]
    config: String,

    /// Opentelemetry endpoint (http://ip:port); overrides the config file.
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();

    let otlp_endpoint = opt.otlp_endpoint.clone().or_else(|| Settings::load(&opt.config).ok().and_then(|s| s.otlp_endpoint));
    setup_tracing(otlp_endpoint.as_deref())?;

    info!(event = "startup", config = %opt.config, "starting tusistor");

    let sup = Supervisor::new(opt.config);
    sup.run().await?;

    info!(event = "shutdown", "tusistor stopped");
    Ok(())
}

fn setup_tracing(otlp_endpoint: Option<&str>) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let Some(endpoint) = otlp_endpoint else {
        use tracing_subscriber::EnvFilter;

        let env_filter = EnvFilter::from_default_env();
        let enable_color = std::io::stdout().is_terminal();

        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .with_ansi(enable_color)
            .init();
        return Ok(());
    };

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint).with_timeout(Duration::from_secs(3)))
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(16)
                .with_resource(Resource::new(vec![KeyValue::new("service.name", "tusistor")])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let fmt_layer = tracing_subscriber::fmt::layer();
    let opentelemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let registry = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with(fmt_layer)
        .with(opentelemetry);
    registry.try_init()?;

    Ok(())
}
