//! CLI interface for Warden
//!
//! This module provides the command-line interface using clap's derive API.
//! The commands are operator tools around the trust core: validating
//! manifests, scanning and signing artifacts, and dry-running dependency
//! resolution.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Warden plugin trust tool
///
/// Checks plugin manifests and artifacts the same way the engine does
/// before an install.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate a plugin manifest
    Manifest {
        /// Manifest file (JSON)
        file: PathBuf,
    },

    /// Run the artifact trust scan
    Scan {
        /// Artifact file
        file: PathBuf,

        /// URL the artifact was downloaded from
        #[arg(long, value_name = "URL")]
        source: Option<String>,
    },

    /// Append a signature block to an artifact
    Sign {
        /// Artifact file
        file: PathBuf,

        /// File holding a hex-encoded 32-byte Ed25519 seed
        #[arg(long, value_name = "PATH")]
        key: PathBuf,

        /// Certificate subject recorded for the signer
        #[arg(long, default_value = "warden")]
        subject: String,

        /// Signed attribute, repeatable (key=value)
        #[arg(long = "attr", value_name = "KEY=VALUE")]
        attributes: Vec<String>,

        /// Output file (default: <file>.signed)
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },

    /// Verify an artifact's signatures against the configured trust store
    Verify {
        /// Artifact file
        file: PathBuf,
    },

    /// Dry-run dependency resolution for a manifest
    Resolve {
        /// Manifest of the plugin to resolve
        manifest: PathBuf,

        /// Directory of manifests treated as installed
        #[arg(long, value_name = "DIR")]
        installed: Option<PathBuf>,

        /// Directory of manifests treated as available for install
        #[arg(long, value_name = "DIR")]
        available: Option<PathBuf>,
    },
}
