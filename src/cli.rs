use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Root directory for persistent broker state (config defaults, downloaded
/// embedding models).
pub fn metatools_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".metatools")
}

/// Directory for the on-disk tool cache (`cache.json`).
pub fn metatools_cache_home() -> PathBuf {
    metatools_home()
}

#[derive(Parser)]
#[command(
    name = "metatools",
    version,
    about = "MCP gateway with meta-tool server"
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/metatools.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway, serving it over the configured (or overridden) transport.
    Serve {
        /// Override `transport.kind` from the config file.
        #[arg(long, value_enum)]
        transport: Option<CliTransportKind>,

        /// Override `transport.host`. Only meaningful for `sse`/`streamable`.
        #[arg(long)]
        host: Option<String>,

        /// Override `transport.port`. Only meaningful for `sse`/`streamable`.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum CliTransportKind {
    Stdio,
    Sse,
    Streamable,
}

impl From<CliTransportKind> for crate::config::TransportKind {
    fn from(value: CliTransportKind) -> Self {
        match value {
            CliTransportKind::Stdio => crate::config::TransportKind::Stdio,
            CliTransportKind::Sse => crate::config::TransportKind::Sse,
            CliTransportKind::Streamable => crate::config::TransportKind::Streamable,
        }
    }
}
