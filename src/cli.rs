use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "kubecmds",
    version,
    about = "Runs kubectl commands for the dashboard and streams their output."
)]
pub struct CliArgs {
    /// Path to a YAML config file (overrides discovery)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Only commands starting with this executable are accepted
    #[arg(long)]
    pub executable: Option<String>,

    /// Wall-clock timeout for non-streaming commands, in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
