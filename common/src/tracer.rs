use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

/// Initialises the stdout tracer for a component.
///
/// The log level is taken from the `RUST_LOG` environment variable.
/// Must be called at most once per process.
pub struct TracerEngine {
    service_name: String,
}

impl TracerEngine {
    pub fn new(service_name: &str) -> Result<Self, SetGlobalDefaultError> {
        let stdout_tracer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(true);

        let log_filter = EnvFilter::from_default_env();

        let subscriber =
            tracing_subscriber::Registry::default().with(stdout_tracer.with_filter(log_filter));

        tracing::subscriber::set_global_default(subscriber)?;

        Ok(Self {
            service_name: service_name.to_owned(),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}
