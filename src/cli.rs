//! Command-line surface (spec.md §6): `-config`, `-debug`, `-version`,
//! `-enable-management-api`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "weather-relay", version, about = "Weather-station telemetry ingestion and distribution engine")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long = "config", default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose (debug-level) logging.
    #[arg(long = "debug", default_value_t = false)]
    pub debug: bool,

    /// Seed and serve the bootstrap management-API controller state.
    #[arg(long = "enable-management-api", default_value_t = false)]
    pub enable_management_api: bool,
}
