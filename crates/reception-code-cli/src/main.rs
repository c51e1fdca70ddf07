#![doc = include_str!("../README.md")]

mod cli;

use clap::Parser;
use cli::commands::App;
use cli::config::{CliArgs, CliConfig};
use cli::telemetry::init_telemetry;

fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = CliConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let app = App::open(config)?;
    let result = app.run(&mut std::io::stdout().lock());

    #[cfg(feature = "tracing")]
    if let Err(e) = &result {
        tracing::error!("command failed: {e:#}");
    }

    providers.shutdown(app.stats());
    result
}

fn log_startup_info(_config: &CliConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Running with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Running against {} with {} categories",
            _config.database.display(),
            _config.categories.len()
        );
    }
}
