use std::path::PathBuf;

use clap::Parser;

/// Command line arguments
#[derive(Parser)]
#[command(about = "Lightning connector daemon for lnd", author = env!("CARGO_PKG_AUTHORS"), version = env!("CARGO_PKG_VERSION"))]
pub struct CLIArgs {
    /// Use the <directory> as the location of the config file and logs
    #[arg(short, long, required = false)]
    pub work_dir: Option<PathBuf>,
    /// Use the <file name> as the location of the config file
    #[arg(short, long, required = false)]
    pub config: Option<PathBuf>,
    /// Install the tracing subscriber
    #[arg(long, required = false)]
    pub enable_logging: bool,
    /// Log filter, overrides the [logging] level of the config file
    #[arg(short, long, required = false)]
    pub log_level: Option<String>,
}
