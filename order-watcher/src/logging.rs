use anyhow::{Context as _, Result as AnyResult};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct LogOptions {
    /// Log filter, e.g. "info,order_watcher=debug". See
    /// <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html>
    #[structopt(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,

    /// Emit logs as JSON instead of human-readable text.
    #[structopt(long, env = "LOG_JSON")]
    log_json: bool,
}

impl LogOptions {
    pub fn init(&self) -> AnyResult<()> {
        let filter = EnvFilter::try_new(&self.log_filter)
            .with_context(|| format!("invalid log filter {:?}", self.log_filter))?;
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        if self.log_json {
            subscriber.json().try_init()
        } else {
            subscriber.try_init()
        }
        .map_err(|error| anyhow::anyhow!(error))
        .context("error initializing log subscriber")
    }
}
