//! Dockyard - Entry Point
//!
//! Deploys Docker Compose stacks from templates, injects the tunnel agent
//! sidecar and backs deployments up.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use dockyard::app::options::AppOptions;
use dockyard::app::run::run;
use dockyard::filesys::file::File;
use dockyard::logs::{init_logging, LogOptions};
use dockyard::storage::layout::StorageLayout;
use dockyard::storage::settings::Settings;
use dockyard::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let mut cli_args: HashMap<String, String> = HashMap::new();
    for arg in env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    let mut layout = match cli_args.get("data-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(PathBuf::from(path)),
        None => layout.settings_file(),
    };
    let settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let (None, Some(dir)) = (cli_args.get("data-dir"), &settings.data_dir) {
        layout = StorageLayout::new(dir);
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        json_format: settings.log_json,
        file_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    let options = match AppOptions::from_settings(&settings, layout) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Running Dockyard {} ({}) with data directory {}",
        version.version,
        version.git_hash,
        options.layout.base_dir.display()
    );
    match run(options, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run Dockyard: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl+C received, shutting down...");
                    }
                }
                return;
            }
            _ => warn!("Failed to install signal handlers, waiting for Ctrl+C only"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received, shutting down...");
}
