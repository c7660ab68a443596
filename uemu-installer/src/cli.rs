use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use uemu_core::config::{Arch, ProvisionConfig};
use uemu_error::Result;

#[derive(Parser, Debug)]
#[command(author, version, about = "Download and set up Ubuntu Touch emulator instances")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create new emulator instance named NAME from the image server.
    Create(CreateArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct CreateArgs {
    /// Instance name.
    pub name: String,

    /// TOML file with defaults; flags given here take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Select device channel.
    #[arg(long)]
    pub channel: Option<String>,

    /// Select image server.
    #[arg(long)]
    pub server: Option<String>,

    /// Select revision; zero or negative counts back from the latest.
    #[arg(long, allow_negative_numbers = true)]
    pub revision: Option<i64>,

    /// Use raw disks instead of qcow2.
    #[arg(long = "use-raw-disk")]
    pub raw_disk: bool,

    /// Create an external vfat sdcard.
    #[arg(long)]
    pub with_sdcard: bool,

    /// Device architecture to use (i386 or armhf).
    #[arg(long)]
    pub arch: Option<Arch>,

    /// Default password for the phablet user.
    #[arg(long)]
    pub password: Option<String>,

    /// Use a different locale than the default one (e.g. es_AR.utf8).
    #[arg(long)]
    pub locale: Option<String>,

    /// Where instances are created.
    #[arg(long)]
    pub data_root: Option<PathBuf>,

    /// Download cache.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Log file; defaults to uemu.log under the data root.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl CreateArgs {
    /// Defaults, then the config file, then flags.
    pub fn config(&self) -> Result<ProvisionConfig> {
        let base = match &self.config {
            Some(path) => ProvisionConfig::load(path)?,
            None => ProvisionConfig::default(),
        };
        Ok(self.apply(base))
    }

    pub fn apply(&self, mut cfg: ProvisionConfig) -> ProvisionConfig {
        if let Some(channel) = &self.channel {
            cfg.channel = channel.clone();
        }
        if let Some(server) = &self.server {
            cfg.server = server.clone();
        }
        if let Some(revision) = self.revision {
            cfg.revision = revision;
        }
        cfg.raw_disk |= self.raw_disk;
        cfg.with_sdcard |= self.with_sdcard;
        if let Some(arch) = self.arch {
            cfg.arch = arch;
        }
        if let Some(password) = &self.password {
            cfg.password = password.clone();
        }
        if let Some(locale) = &self.locale {
            cfg.locale = Some(locale.clone());
        }
        if let Some(data_root) = &self.data_root {
            cfg.data_root = data_root.clone();
        }
        if let Some(cache_dir) = &self.cache_dir {
            cfg.cache_dir = cache_dir.clone();
        }
        cfg
    }
}
