use anyhow::{Context, Result};
use clap::Parser;
use corne_flash::cli::{self, Cli, TerminalPrompt};
use corne_flash::system::SystemHost;
use log::LevelFilter;
use std::sync::atomic::{AtomicBool, Ordering};

// Set by Ctrl-C. Flashing polls it so the volume is unmounted before we exit.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = cli::exit_code(&e);
            // Nothing useful to do if the terminal is gone.
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("CORNE_FLASH_LOG", "info")
            .write_style("CORNE_FLASH_LOG_STYLE"),
    );
    if args.debug {
        logger.filter_module("corne_flash", LevelFilter::Debug);
    }
    logger.init();

    ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    let settings = args.settings()?;
    let host = SystemHost::new(settings.use_sudo);

    cli::run(
        &args,
        &settings,
        &host,
        &INTERRUPTED,
        &mut TerminalPrompt,
        &mut std::io::stdout(),
    )
}
