use clap::Parser;
use std::path::PathBuf;

use starbridge_config::StarbridgeConfig;

/// Debug adapter for Bazel's Starlark debugger.
///
/// Speaks the Debug Adapter Protocol over stdio.
#[derive(Debug, Parser)]
#[command(name = "starbridge-dap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `STARBRIDGE_CONFIG` is used as a fallback. When neither are
    /// provided the adapter uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config);
    starbridge_config::init_tracing(&config.logging);
    tracing::info!(target: "starbridge.dap", version = env!("CARGO_PKG_VERSION"), "starting");

    starbridge_dap::server::run_stdio(config.debugger).await
}

fn load_config(cli_path: Option<PathBuf>) -> StarbridgeConfig {
    let Some(path) = StarbridgeConfig::resolve_path(cli_path) else {
        return StarbridgeConfig::default();
    };

    match StarbridgeConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            // Logging is not set up yet; stdout belongs to DAP.
            eprintln!(
                "starbridge-dap: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            StarbridgeConfig::default()
        }
    }
}
