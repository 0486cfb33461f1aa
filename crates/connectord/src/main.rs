//! Connector daemon
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use anyhow::Result;
use clap::Parser;
use connectord::cli::CLIArgs;
use connectord::{get_work_directory, load_settings, run_connectord, setup_tracing};
use tokio::runtime::Runtime;

fn main() -> Result<()> {
    let rt = Runtime::new()?;

    rt.block_on(async {
        let args = CLIArgs::parse();
        let work_dir = get_work_directory(&args).await?;
        let mut settings = load_settings(&work_dir, args.config.as_deref())?;

        if let Some(level) = args.log_level {
            settings.logging.level = level;
        }

        let _log_guard = if args.enable_logging {
            setup_tracing(&work_dir, &settings.logging)?
        } else {
            None
        };

        run_connectord(settings).await
    })
}
