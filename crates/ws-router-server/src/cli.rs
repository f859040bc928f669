use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ws-router-server",
    version,
    about = "HTTP and WebSocket server routed through one middleware stack"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Verb websocket routes are registered under (overrides config file setting)
    #[arg(long)]
    pub method_name: Option<String>,

    /// Log level filter when RUST_LOG is unset (overrides config file setting)
    #[arg(long)]
    pub log_level: Option<String>,
}
