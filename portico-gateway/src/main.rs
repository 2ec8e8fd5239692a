use clap::Parser;

use portico_gateway::app;
use portico_gateway::config::{Config, ConfigFile};

/// Default config file name.
const DEFAULT_CONFIG: &str = "portico.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config file as env-var defaults (before clap parsing).
    let config_path =
        std::env::var("PORTICO_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let path = std::path::Path::new(&config_path);
    if path.exists() {
        match ConfigFile::load(path) {
            Ok(file) => file.inject_env(),
            Err(e) => eprintln!("warning: ignoring config file {config_path}: {e}"),
        }
    }

    let config = Config::parse();
    app::run(config).await
}
