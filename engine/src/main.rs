// Warden plugin trust tool
// Main entry point for the warden binary

use clap::Parser;
use warden_engine::cli::{Cli, Command};
use warden_engine::config::Config;
use warden_engine::handlers::{
    handle_manifest, handle_resolve, handle_scan, handle_sign, handle_verify, OutputFormat,
};
use warden_engine::telemetry::{init_json_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    if cli.json {
        init_json_telemetry(level);
    } else {
        init_telemetry_with_level(level);
    }

    tracing::info!("Warden v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Manifest { file } => handle_manifest(&file, format),
        Command::Scan { file, source } => handle_scan(&config, &file, source.as_deref(), format),
        Command::Sign {
            file,
            key,
            subject,
            attributes,
            out,
        } => handle_sign(&file, &key, &subject, &attributes, out.as_deref(), format),
        Command::Verify { file } => handle_verify(&config, &file, format),
        Command::Resolve {
            manifest,
            installed,
            available,
        } => handle_resolve(
            &manifest,
            installed.as_deref(),
            available.as_deref(),
            format,
        ),
    }
}
