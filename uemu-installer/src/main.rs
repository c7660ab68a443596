use std::sync::Arc;

use clap::Parser;
use uemu_hal::LinuxHal;
use uemu_installer::cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Create(args) => {
            let created = uemu_installer::run::create(&args, Arc::new(LinuxHal::new()))?;
            println!(
                "Successfully created emulator instance {} (revision {}) in {}",
                created.name,
                created.version,
                created.data_dir.display()
            );
        }
    }
    Ok(())
}
