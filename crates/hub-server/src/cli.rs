//! Command-line flags, layered over `Settings` (§4.8/§6 — the binary itself
//! is host glue, not part of the spec's component surface).

use clap::Parser;

/// Run the integration hub as a standalone server.
#[derive(Debug, Parser)]
#[command(name = "hub-server", version, about)]
pub struct Cli {
    /// Override the configured bind port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the tracing env-filter directive.
    #[arg(long)]
    pub log_filter: Option<String>,
}
