use std::path::PathBuf;
use std::process::ExitCode;

use procmux::config::ServerSettings;
use procmux::utils::logging;
use procmux::Server;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "procmux.toml";

fn load_settings() -> procmux::Result<ServerSettings> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let mut settings = if path.exists() {
        ServerSettings::from_file(&path)?
    } else {
        ServerSettings::default()
    };
    settings.apply_env();
    Ok(settings)
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("procmux: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&settings.logging) {
        eprintln!("procmux: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        programs = settings.programs.len(),
        "Starting procmux"
    );

    let result = match Server::new(settings) {
        Ok(server) => server.run().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
