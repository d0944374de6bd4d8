//! Deployment Monitor - Entry Point
//!
//! Executes, cancels and restarts deployment requests. Several instances may
//! run side by side against the same store for high availability.

use std::collections::HashMap;
use std::env;

use deploymon::app::options::AppOptions;
use deploymon::app::run::run;
use deploymon::filesys::file::File;
use deploymon::logs::{init_logging, LogOptions};
use deploymon::storage::layout::StorageLayout;
use deploymon::storage::settings::Settings;
use deploymon::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
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
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(base_dir) => StorageLayout::new(base_dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let (settings, settings_error) = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => (settings, None),
            Err(e) => {
                eprintln!("Unable to read settings file {:?}: {}", settings_file.path(), e);
                return;
            }
        }
    } else {
        (
            Settings::default(),
            Some(format!("{:?} not found, using defaults", settings_file.path())),
        )
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };
    if let Some(message) = settings_error {
        warn!("Settings file {}", message);
    }

    // Run the monitor
    let options = AppOptions::from_settings(&settings, layout);

    info!("Running deployment monitor with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the monitor: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    warn!("Unable to install signal handlers, waiting for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl+C received, shutting down...");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
